//! Steward Criteria - boolean expressions over node facts
//!
//! `compile` turns an expression such as
//! `"container" in facts.backends and not exists(facts.parent_id)` into a
//! [`Predicate`] that can be evaluated against any JSON document.

pub mod functions;
pub mod lexer;
pub mod parser;
pub mod predicate;

pub use functions::{ExtensionFn, Functions};
pub use parser::{CompareOp, Expr};
pub use predicate::{compile, truthy, Predicate};
