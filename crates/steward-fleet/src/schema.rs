//! Table declarations for the fleet model.

use steward_store::{Column, ColumnType, Schema};

pub const NODES: &str = "nodes";
pub const FACTS: &str = "facts";
pub const ADVENTURES: &str = "adventures";

pub fn nodes() -> Schema {
    Schema::new(NODES)
        .column(Column::new("id", ColumnType::Integer).primary_key())
        .column(Column::new("name", ColumnType::Text(255)).required().unique())
}

/// `node_id` and `key` are fixed at creation; only `value` changes.
pub fn facts() -> Schema {
    Schema::new(FACTS)
        .column(Column::new("id", ColumnType::Integer).primary_key())
        .column(Column::new("node_id", ColumnType::Integer).required().read_only())
        .column(Column::new("key", ColumnType::Text(64)).required().read_only())
        .column(Column::new("value", ColumnType::StructuredEntry).required())
}

pub fn adventures() -> Schema {
    Schema::new(ADVENTURES)
        .column(Column::new("id", ColumnType::Integer).primary_key())
        .column(Column::new("name", ColumnType::Text(255)).required().unique())
        .column(Column::new("criteria", ColumnType::Text(0)).required())
        .column(Column::new("dsl", ColumnType::StructuredBlob).required())
}
