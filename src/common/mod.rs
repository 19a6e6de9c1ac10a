//! Shared utilities that glue the feature store, registry and inference domains together.
pub mod config;
pub mod error;
pub mod fsio;
pub mod ids;
pub mod lease;
pub mod log;
pub mod time;
pub mod value;

pub use error::{DeltaCode, DeltaError, DeltaResult};
pub use time::Timestamp;
pub use value::{Value, ValueType};
