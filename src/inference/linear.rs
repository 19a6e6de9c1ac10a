//! Built-in `linear` flavor: a weighted sum plus bias over numeric columns.

use serde::{Deserialize, Serialize};

use crate::common::error::{DeltaError, DeltaResult};
use crate::common::value::Value;
use crate::registry::domain::ModelArtifact;

use super::domain::{Flavor, Predictor};

pub const FLAVOR: &str = "linear";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LinearModel {
    pub fn new(weights: Vec<f64>, bias: f64) -> Self {
        Self { weights, bias }
    }

    pub fn to_artifact(&self) -> DeltaResult<ModelArtifact> {
        Ok(ModelArtifact::new(FLAVOR, serde_json::to_vec(self)?))
    }
}

impl Predictor for LinearModel {
    fn predict(&self, inputs: &[Vec<Value>]) -> DeltaResult<Vec<Value>> {
        inputs
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                if row.len() != self.weights.len() {
                    return Err(DeltaError::invalid(format!(
                        "row {idx} has {} columns, model has {} weights",
                        row.len(),
                        self.weights.len()
                    )));
                }
                let mut acc = self.bias;
                for (w, cell) in self.weights.iter().zip(row) {
                    let x = cell.as_f64().ok_or_else(|| {
                        DeltaError::invalid(format!("row {idx} has a non-numeric cell"))
                    })?;
                    acc += w * x;
                }
                Ok(Value::Float(acc))
            })
            .collect()
    }
}

/// Loader registered on every model registry by default.
#[derive(Default)]
pub struct LinearFlavor;

impl Flavor for LinearFlavor {
    fn name(&self) -> &str {
        FLAVOR
    }

    fn load(&self, bytes: &[u8]) -> DeltaResult<Box<dyn Predictor>> {
        let model: LinearModel = serde_json::from_slice(bytes)?;
        Ok(Box::new(model))
    }
}
