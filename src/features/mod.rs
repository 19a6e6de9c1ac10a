//! Feature store: entity-keyed feature values served point-in-time for training
//! and from a materialized online table for serving.

pub mod domain;
pub mod repo_fs;
pub mod service;

pub use domain::{EntityRow, FeatureField, FeatureRef, FeatureRow, FeatureTable, FeatureView};
pub use service::FeatureStore;
