//! AST for the Quiver expression language.

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    /// A bare identifier; resolved against the evaluation environment.
    Var(String),
    /// `expr.field`
    Field(Box<Expr>, String),
    /// `expr[index]`
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// One accessor in an assignment target path.
#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    Field(String),
    Index(Expr),
}

/// The left-hand side of an assignment: a root variable plus a path into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub root: String,
    pub path: Vec<Accessor>,
}

impl Target {
    /// Dotted field path up to (not including) the first index accessor.
    ///
    /// Schema field tables are keyed by dotted paths without indexes, so this
    /// is the portion a schema check can validate.
    pub fn field_prefix(&self) -> String {
        let mut parts = Vec::new();
        for acc in &self.path {
            match acc {
                Accessor::Field(name) => parts.push(name.as_str()),
                Accessor::Index(_) => break,
            }
        }
        parts.join(".")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { target: Target, value: Expr },
    Expr(Expr),
}

/// A parsed block: zero or more statements in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}
