//! Inference entry points. The registry adds no transformation: inputs are checked
//! against the recorded signature and handed to the artefact's own predictor.

use std::time::Instant;

use tracing::debug;

use crate::common::error::{DeltaError, DeltaResult};
use crate::common::time;
use crate::common::value::Value;

use super::domain::LoadedModel;

/// Perform a single inference call using the provided model.
pub fn predict(model: &LoadedModel, inputs: &[Vec<Value>]) -> DeltaResult<Vec<Value>> {
    let start = Instant::now();
    if let Some(signature) = &model.signature {
        signature.check_inputs(inputs)?;
    }
    let outputs = model.predictor.predict(inputs)?;
    if outputs.len() != inputs.len() {
        return Err(DeltaError::internal(format!(
            "predictor returned {} outputs for {} rows",
            outputs.len(),
            inputs.len()
        )));
    }
    debug!(
        model = %model.reference,
        rows = inputs.len(),
        dur_ms = time::elapsed_ms(start) as u64,
        "prediction served"
    );
    Ok(outputs)
}

/// Run `predict` for every batch; the first failing batch aborts the call.
pub fn batch_predict(
    model: &LoadedModel,
    batches: &[Vec<Vec<Value>>],
) -> DeltaResult<Vec<Vec<Value>>> {
    batches.iter().map(|batch| predict(model, batch)).collect()
}
