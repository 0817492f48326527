//! Steward Core - shared types, configuration, and error handling

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StewardConfig;
pub use error::{Error, Result};
pub use types::*;
