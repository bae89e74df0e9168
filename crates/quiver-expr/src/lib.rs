//! Sandboxed expression language for Quiver config blocks and contracts.
//!
//! A small interpreted subset (field access, indexing, arithmetic,
//! comparisons, list/dict literals, and assignment statements) with a bound
//! execution budget and no ambient I/O. Contracts evaluate a single boolean
//! expression against resolved step configurations; config blocks run a
//! statement list against a mutable `config` scope.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;

pub use ast::{Accessor, BinaryOp, Expr, Program, Stmt, Target, UnaryOp};
pub use eval::{eval_bool, eval_expression, expression_roots, run_block, Env, EvalLimits};
pub use parser::{parse_expression, parse_program};
