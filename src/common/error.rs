//! Error handling primitives shared across the core.
//!
//! Every variant maps onto a stable numeric [`DeltaCode`] so callers outside
//! Rust can switch on the code without parsing messages.

use thiserror::Error;

/// Stable error codes exposed to callers.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeltaCode {
    /// Success code used as a sentinel.
    Ok = 0,
    /// Input failed validation.
    InvalidInput = 1,
    /// Feature reference is not of the form `<view>.<feature>`.
    InvalidFeatureReference = 2,
    /// Feature reference names a feature no view declares.
    UnknownFeatureReference = 3,
    /// Model reference string could not be parsed.
    InvalidModelReference = 4,
    /// Model reference does not resolve to a stored artefact.
    UnknownModelReference = 5,
    /// Run identifier was never logged.
    UnknownRun = 6,
    /// Inference input does not match the recorded signature.
    SignatureMismatch = 7,
    /// A concurrent logger claimed the same version first.
    VersionConflict = 8,
    /// Transient storage failure; safe to retry.
    StorageUnavailable = 9,
    /// Catch-all for bugs and corrupt state.
    Internal = 10,
}

/// Canonical error type for the core.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid feature reference `{0}`, expected `<view>.<feature>`")]
    InvalidFeatureReference(String),
    #[error("feature reference `{0}` is not declared by any feature view")]
    UnknownFeatureReference(String),
    #[error("invalid model reference `{0}`")]
    InvalidModelReference(String),
    #[error("unknown model reference `{0}`")]
    UnknownModelReference(String),
    #[error("unknown run `{0}`")]
    UnknownRun(String),
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),
    #[error("version {version} of `{name}` was claimed concurrently")]
    VersionConflict { name: String, version: u32 },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate.
pub type DeltaResult<T> = Result<T, DeltaError>;

impl DeltaError {
    /// Machine parsable code for this error.
    pub fn code(&self) -> DeltaCode {
        match self {
            DeltaError::InvalidInput(_) => DeltaCode::InvalidInput,
            DeltaError::InvalidFeatureReference(_) => DeltaCode::InvalidFeatureReference,
            DeltaError::UnknownFeatureReference(_) => DeltaCode::UnknownFeatureReference,
            DeltaError::InvalidModelReference(_) => DeltaCode::InvalidModelReference,
            DeltaError::UnknownModelReference(_) => DeltaCode::UnknownModelReference,
            DeltaError::UnknownRun(_) => DeltaCode::UnknownRun,
            DeltaError::SignatureMismatch(_) => DeltaCode::SignatureMismatch,
            DeltaError::VersionConflict { .. } => DeltaCode::VersionConflict,
            DeltaError::StorageUnavailable(_) => DeltaCode::StorageUnavailable,
            DeltaError::Internal(_) => DeltaCode::Internal,
        }
    }

    /// Whether the same call may succeed if repeated unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeltaError::StorageUnavailable(_) | DeltaError::VersionConflict { .. }
        )
    }

    /// Validation helper.
    pub fn invalid(msg: impl Into<String>) -> Self {
        DeltaError::InvalidInput(msg.into())
    }

    /// Transient storage helper.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        DeltaError::StorageUnavailable(msg.into())
    }

    /// Internal error helper.
    pub fn internal(msg: impl Into<String>) -> Self {
        DeltaError::Internal(msg.into())
    }
}

impl From<std::io::Error> for DeltaError {
    fn from(err: std::io::Error) -> Self {
        DeltaError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for DeltaError {
    fn from(err: serde_json::Error) -> Self {
        DeltaError::Internal(format!("corrupt record: {err}"))
    }
}

impl From<config::ConfigError> for DeltaError {
    fn from(err: config::ConfigError) -> Self {
        DeltaError::InvalidInput(format!("configuration: {err}"))
    }
}
