//! Steward Store - schema-validated in-memory entity tables
//!
//! Every table is declared up front with a [`Schema`]. Writes to declared
//! columns are coerced to the column type; undeclared columns are stored
//! verbatim.

pub mod schema;
pub mod store;
pub mod table;

pub use schema::{coerce, Column, ColumnType, Mismatch, Schema};
pub use store::TypedStore;
pub use table::Table;
