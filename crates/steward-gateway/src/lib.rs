//! Steward Gateway - service facade, HTTP routing, and the `steward` binary

pub mod server;
pub mod service;

pub use server::{router, serve, ApiError};
pub use service::StewardService;
