//! Steward Fleet - nodes, facts, hierarchy, and adventure eligibility

pub mod adventures;
pub mod graph;
pub mod registration;
pub mod schema;
pub mod tree;

pub use adventures::AdventureCatalog;
pub use graph::{FactGraph, GraphSnapshot, NodeView};
pub use registration::UNPROVISIONED;
pub use tree::TreeNode;
