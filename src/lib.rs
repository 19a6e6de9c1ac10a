//! Feature store and model registry for the ML lifecycle.
//!
//! `features` serves entity-keyed values point-in-time for training and from a
//! materialized online table for serving. `registry` tracks training runs and owns
//! the model version ledger. `inference` loads registered artefacts and predicts.
pub mod common;
pub mod features;
pub mod inference;
pub mod registry;

pub use common::config::AppCfg;
pub use common::{DeltaCode, DeltaError, DeltaResult, Timestamp, Value, ValueType};
pub use features::{EntityRow, FeatureRef, FeatureRow, FeatureStore, FeatureTable, FeatureView};
pub use inference::{Flavor, LinearModel, LoadedModel, Predictor};
pub use registry::{LogModel, LogRequest, ModelRef, ModelRegistry, RunId, Signature};
