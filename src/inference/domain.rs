//! Predictor and flavor contracts plus the loaded-model handle returned by the registry.

use std::fmt;

use crate::common::error::DeltaResult;
use crate::common::value::Value;
use crate::registry::domain::{ModelRef, ModelVersion, RunId, Signature};

/// Anything that maps input rows to one output per row.
pub trait Predictor: Send + Sync {
    fn predict(&self, inputs: &[Vec<Value>]) -> DeltaResult<Vec<Value>>;
}

/// Turns stored artefact bytes back into a predictor.
pub trait Flavor: Send + Sync {
    fn name(&self) -> &str;
    fn load(&self, bytes: &[u8]) -> DeltaResult<Box<dyn Predictor>>;
}

/// A resolved artefact, ready for inference. Read-only view of registry state.
pub struct LoadedModel {
    pub reference: ModelRef,
    pub run_id: RunId,
    /// Present when resolved through a registered name.
    pub version: Option<ModelVersion>,
    pub signature: Option<Signature>,
    pub(crate) predictor: Box<dyn Predictor>,
}

impl LoadedModel {
    /// Validate `inputs` against the signature and delegate to the predictor.
    pub fn predict(&self, inputs: &[Vec<Value>]) -> DeltaResult<Vec<Value>> {
        super::service::predict(self, inputs)
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("reference", &self.reference)
            .field("run_id", &self.run_id)
            .field("version", &self.version.as_ref().map(|v| v.version))
            .finish_non_exhaustive()
    }
}
