//! Evaluator for the Quiver expression language.
//!
//! Expressions run against a read-only environment mapping root names to
//! configuration objects (contract mode), or additionally against one bound
//! mutable scope (config-block mode, conventionally named `config`).
//!
//! Evaluation is treated as untrusted: every node costs one unit of fuel and
//! the wall clock is checked alongside it, so a pathological expression fails
//! with [`QuiverError::EvalTimeout`] instead of stalling resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use quiver_types::{QuiverError, Result};
use serde_json::Value;

use crate::ast::*;
use crate::parser::{parse_expression, parse_program};

/// Read-only variable bindings: root name -> value.
pub type Env = BTreeMap<String, Value>;

/// Execution budget for one expression or config block.
#[derive(Debug, Clone, Copy)]
pub struct EvalLimits {
    /// Maximum number of AST nodes evaluated.
    pub fuel: u64,
    /// Wall-clock bound, checked together with fuel.
    pub timeout: Duration,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            fuel: 10_000,
            timeout: Duration::from_secs(1),
        }
    }
}

struct Budget {
    fuel: u64,
    started: Instant,
    timeout: Duration,
}

impl Budget {
    fn new(limits: &EvalLimits) -> Self {
        Self {
            fuel: limits.fuel,
            started: Instant::now(),
            timeout: limits.timeout,
        }
    }

    fn tick(&mut self, source: &str) -> Result<()> {
        if self.fuel == 0 || self.started.elapsed() > self.timeout {
            return Err(QuiverError::EvalTimeout {
                expression: source.to_string(),
                elapsed_ms: self.started.elapsed().as_millis() as u64,
            });
        }
        self.fuel -= 1;
        Ok(())
    }
}

struct EvalCtx<'a> {
    source: &'a str,
    env: &'a Env,
    scope_name: Option<&'a str>,
    budget: Budget,
}

impl<'a> EvalCtx<'a> {
    fn error(&self, message: impl Into<String>) -> QuiverError {
        QuiverError::Eval {
            expression: self.source.to_string(),
            message: message.into(),
        }
    }

    fn available_roots(&self) -> String {
        let mut names: Vec<&str> = self.env.keys().map(String::as_str).collect();
        if let Some(scope) = self.scope_name {
            names.push(scope);
        }
        names.sort_unstable();
        names.join(", ")
    }

    fn lookup_root(&self, name: &str, scope: Option<&Value>) -> Result<Value> {
        if self.scope_name == Some(name) {
            if let Some(value) = scope {
                return Ok(value.clone());
            }
        }
        self.env.get(name).cloned().ok_or_else(|| {
            self.error(format!(
                "unknown name '{}' (environment: {})",
                name,
                self.available_roots()
            ))
        })
    }

    fn eval(&mut self, expr: &Expr, scope: Option<&Value>) -> Result<Value> {
        self.budget.tick(self.source)?;
        match expr {
            Expr::Int(v) => Ok(Value::from(*v)),
            Expr::Float(v) => Ok(Value::from(*v)),
            Expr::Str(v) => Ok(Value::from(v.clone())),
            Expr::Bool(v) => Ok(Value::from(*v)),
            Expr::Null => Ok(Value::Null),
            Expr::Var(name) => self.lookup_root(name, scope),
            Expr::Field(inner, field) => {
                let value = self.eval(inner, scope)?;
                match value {
                    Value::Object(map) => map.get(field).cloned().ok_or_else(|| {
                        self.error(format!("no field '{field}' in object"))
                    }),
                    other => Err(self.error(format!(
                        "cannot access field '{field}' on {}",
                        type_name(&other)
                    ))),
                }
            }
            Expr::Index(inner, index) => {
                let value = self.eval(inner, scope)?;
                let index = self.eval(index, scope)?;
                match (&value, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let i = n
                            .as_i64()
                            .filter(|i| *i >= 0)
                            .ok_or_else(|| self.error("list index must be a non-negative integer"))?
                            as usize;
                        items.get(i).cloned().ok_or_else(|| {
                            self.error(format!(
                                "index {i} out of bounds for list of length {}",
                                items.len()
                            ))
                        })
                    }
                    (Value::Object(map), Value::String(key)) => {
                        map.get(key).cloned().ok_or_else(|| {
                            self.error(format!("no key '{key}' in dict"))
                        })
                    }
                    _ => Err(self.error(format!(
                        "cannot index {} with {}",
                        type_name(&value),
                        type_name(&index)
                    ))),
                }
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner, scope)?;
                match op {
                    UnaryOp::Not => match value {
                        Value::Bool(b) => Ok(Value::from(!b)),
                        other => {
                            Err(self.error(format!("'!' expects a boolean, got {}", type_name(&other))))
                        }
                    },
                    UnaryOp::Neg => match &value {
                        Value::Number(n) if n.is_i64() => {
                            Ok(Value::from(-n.as_i64().unwrap_or_default()))
                        }
                        Value::Number(n) => Ok(Value::from(-n.as_f64().unwrap_or_default())),
                        other => {
                            Err(self.error(format!("'-' expects a number, got {}", type_name(other))))
                        }
                    },
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs, scope),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, expr) in entries {
                    map.insert(key.clone(), self.eval(expr, scope)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        scope: Option<&Value>,
    ) -> Result<Value> {
        // Short-circuit logical operators before evaluating the right side.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let left = self.eval(lhs, scope)?;
            let left = self.expect_bool(&left, "logical operator")?;
            return match (op, left) {
                (BinaryOp::And, false) => Ok(Value::from(false)),
                (BinaryOp::Or, true) => Ok(Value::from(true)),
                _ => {
                    let right = self.eval(rhs, scope)?;
                    let right = self.expect_bool(&right, "logical operator")?;
                    Ok(Value::from(right))
                }
            };
        }

        let left = self.eval(lhs, scope)?;
        let right = self.eval(rhs, scope)?;
        match op {
            BinaryOp::Eq => Ok(Value::from(values_equal(&left, &right))),
            BinaryOp::NotEq => Ok(Value::from(!values_equal(&left, &right))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ord = self.compare(&left, &right)?;
                let result = match op {
                    BinaryOp::Lt => ord.is_lt(),
                    BinaryOp::Le => ord.is_le(),
                    BinaryOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                };
                Ok(Value::from(result))
            }
            BinaryOp::Add => self.add(&left, &right),
            BinaryOp::Sub => self.arith(op, &left, &right),
            BinaryOp::Mul => self.arith(op, &left, &right),
            BinaryOp::Div => self.arith(op, &left, &right),
            BinaryOp::Rem => self.arith(op, &left, &right),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn expect_bool(&self, value: &Value, what: &str) -> Result<bool> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(self.error(format!("{what} expects booleans, got {}", type_name(other)))),
        }
    }

    fn compare(&self, left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                    Ok(a.cmp(&b))
                } else {
                    let (a, b) = (as_f64(a), as_f64(b));
                    a.partial_cmp(&b)
                        .ok_or_else(|| self.error("cannot order NaN"))
                }
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(self.error(format!(
                "cannot order {} against {}",
                type_name(left),
                type_name(right)
            ))),
        }
    }

    fn add(&self, left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::from(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            }
            _ => self.arith(BinaryOp::Add, left, right),
        }
    }

    fn arith(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
        let (Value::Number(a), Value::Number(b)) = (left, right) else {
            return Err(self.error(format!(
                "arithmetic expects numbers, got {} and {}",
                type_name(left),
                type_name(right)
            )));
        };
        if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => {
                    if b == 0 {
                        return Err(self.error("division by zero"));
                    }
                    a.checked_div(b)
                }
                BinaryOp::Rem => {
                    if b == 0 {
                        return Err(self.error("division by zero"));
                    }
                    a.checked_rem(b)
                }
                _ => unreachable!(),
            };
            return result
                .map(Value::from)
                .ok_or_else(|| self.error("integer overflow"));
        }
        let (a, b) = (as_f64(a), as_f64(b));
        let result = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b == 0.0 {
                    return Err(self.error("division by zero"));
                }
                a / b
            }
            BinaryOp::Rem => {
                if b == 0.0 {
                    return Err(self.error("division by zero"));
                }
                a % b
            }
            _ => unreachable!(),
        };
        Ok(Value::from(result))
    }
}

fn as_f64(n: &serde_json::Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Equality used by `==` / `!=`: numeric across int/float, structural
/// otherwise. Mismatched types compare unequal (so `x == null` is usable
/// as a presence check).
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                a == b
            } else {
                as_f64(a) == as_f64(b)
            }
        }
        _ => left == right,
    }
}

/// Evaluate a contract-style expression to a value.
pub fn eval_expression(source: &str, env: &Env, limits: &EvalLimits) -> Result<Value> {
    let expr = parse_expression(source)?;
    let mut ctx = EvalCtx {
        source,
        env,
        scope_name: None,
        budget: Budget::new(limits),
    };
    ctx.eval(&expr, None)
}

/// Evaluate a contract-style expression that must produce a boolean.
pub fn eval_bool(source: &str, env: &Env, limits: &EvalLimits) -> Result<bool> {
    match eval_expression(source, env, limits)? {
        Value::Bool(b) => Ok(b),
        other => Err(QuiverError::Eval {
            expression: source.to_string(),
            message: format!("contract must evaluate to a boolean, got {}", type_name(&other)),
        }),
    }
}

/// Root names referenced by a contract expression, in sorted order.
///
/// Used by the contract evaluator to distinguish an undefined step label
/// from an ordinary evaluation failure.
pub fn expression_roots(source: &str) -> Result<BTreeSet<String>> {
    let expr = parse_expression(source)?;
    let mut roots = BTreeSet::new();
    collect_roots(&expr, &mut roots);
    Ok(roots)
}

fn collect_roots(expr: &Expr, roots: &mut BTreeSet<String>) {
    match expr {
        Expr::Var(name) => {
            roots.insert(name.clone());
        }
        Expr::Field(inner, _) => collect_roots(inner, roots),
        Expr::Index(inner, index) => {
            collect_roots(inner, roots);
            collect_roots(index, roots);
        }
        Expr::Unary(_, inner) => collect_roots(inner, roots),
        Expr::Binary(_, lhs, rhs) => {
            collect_roots(lhs, roots);
            collect_roots(rhs, roots);
        }
        Expr::List(items) => {
            for item in items {
                collect_roots(item, roots);
            }
        }
        Expr::Map(entries) => {
            for (_, value) in entries {
                collect_roots(value, roots);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Config-block execution
// ---------------------------------------------------------------------------

/// An assignment target path with index expressions already evaluated.
enum ResolvedAccessor {
    Field(String),
    Index(Value),
}

/// Execute a config block against a mutable scope.
///
/// Every assignment target must be rooted at `scope_name`; `check_assign` is
/// called with the target before the right-hand side is evaluated, giving the
/// caller a chance to reject paths absent from the step's schema. Expression
/// statements are evaluated for their fuel cost and discarded.
pub fn run_block(
    source: &str,
    scope_name: &str,
    scope: &mut Value,
    env: &Env,
    limits: &EvalLimits,
    check_assign: &dyn Fn(&Target) -> Result<()>,
) -> Result<()> {
    let program = parse_program(source)?;
    let mut ctx = EvalCtx {
        source,
        env,
        scope_name: Some(scope_name),
        budget: Budget::new(limits),
    };

    for stmt in &program.stmts {
        match stmt {
            Stmt::Expr(expr) => {
                ctx.eval(expr, Some(&*scope))?;
            }
            Stmt::Assign { target, value } => {
                if target.root != scope_name {
                    return Err(ctx.error(format!(
                        "assignment target must start with '{scope_name}', found '{}'",
                        target.root
                    )));
                }
                check_assign(target)?;
                let rhs = ctx.eval(value, Some(&*scope))?;
                let mut path = Vec::with_capacity(target.path.len());
                for acc in &target.path {
                    match acc {
                        Accessor::Field(name) => path.push(ResolvedAccessor::Field(name.clone())),
                        Accessor::Index(expr) => {
                            path.push(ResolvedAccessor::Index(ctx.eval(expr, Some(&*scope))?))
                        }
                    }
                }
                assign(&ctx, scope, &path, rhs)?;
            }
        }
    }
    Ok(())
}

fn assign(
    ctx: &EvalCtx<'_>,
    scope: &mut Value,
    path: &[ResolvedAccessor],
    value: Value,
) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        *scope = value;
        return Ok(());
    };
    match head {
        ResolvedAccessor::Field(name) => {
            if scope.is_null() {
                *scope = Value::Object(serde_json::Map::new());
            }
            let Value::Object(map) = scope else {
                return Err(ctx.error(format!(
                    "cannot set field '{name}' on {}",
                    type_name(scope)
                )));
            };
            let slot = map.entry(name.clone()).or_insert(Value::Null);
            assign(ctx, slot, rest, value)
        }
        ResolvedAccessor::Index(index) => match (&mut *scope, index) {
            (Value::Array(items), Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .filter(|i| *i >= 0)
                    .ok_or_else(|| ctx.error("list index must be a non-negative integer"))?
                    as usize;
                if i == items.len() {
                    items.push(Value::Null);
                }
                let slot = items.get_mut(i).ok_or_else(|| {
                    ctx.error(format!("index {i} out of bounds for list assignment"))
                })?;
                assign(ctx, slot, rest, value)
            }
            (Value::Object(map), Value::String(key)) => {
                let slot = map.entry(key.clone()).or_insert(Value::Null);
                assign(ctx, slot, rest, value)
            }
            (other, index) => Err(ctx.error(format!(
                "cannot index {} with {} in assignment",
                type_name(other),
                type_name(index)
            ))),
        },
    }
}
