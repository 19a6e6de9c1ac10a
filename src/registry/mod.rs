//! Model registry: experiment runs, the append-only version ledger and model resolution.

pub mod domain;
pub mod repo_fs;
pub mod service;

pub use domain::{
    ColumnSpec, ModelArtifact, ModelRef, ModelVersion, Run, RunId, Signature, VersionStage,
};
pub use service::{LogModel, LogRequest, ModelRegistry};
