//! Domain types for runs, model versions and artefacts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::error::{DeltaError, DeltaResult};
use crate::common::ids;
use crate::common::time::Timestamp;
use crate::common::value::{Value, ValueType};

/// Identifier of a single training execution.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(ids::fresh_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunId {
    type Err = DeltaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        ids::validate_name("run id", raw)?;
        Ok(Self(raw.to_string()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed model reference. Strings are parsed at the boundary so resolution
/// never sees a malformed reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModelRef {
    /// `models:/<name>/<version>`
    ByVersion { name: String, version: u32 },
    /// `models:/<name>/latest`
    ByLatest { name: String },
    /// `runs:/<run_id>/<artifact_path>`
    ByRun { run_id: RunId, path: String },
}

impl FromStr for ModelRef {
    type Err = DeltaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || DeltaError::InvalidModelReference(raw.to_string());

        if let Some(rest) = raw.strip_prefix("models:/") {
            let (name, selector) = rest.split_once('/').ok_or_else(invalid)?;
            ids::validate_name("model name", name).map_err(|_| invalid())?;
            if selector == "latest" {
                return Ok(ModelRef::ByLatest {
                    name: name.to_string(),
                });
            }
            let version = selector
                .parse::<u32>()
                .ok()
                .filter(|v| *v >= 1)
                .ok_or_else(invalid)?;
            return Ok(ModelRef::ByVersion {
                name: name.to_string(),
                version,
            });
        }

        if let Some(rest) = raw.strip_prefix("runs:/") {
            let (run_id, path) = rest.split_once('/').ok_or_else(invalid)?;
            let run_id = run_id.parse::<RunId>().map_err(|_| invalid())?;
            ids::validate_relative_path("artifact path", path).map_err(|_| invalid())?;
            return Ok(ModelRef::ByRun {
                run_id,
                path: path.to_string(),
            });
        }

        Err(invalid())
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRef::ByVersion { name, version } => write!(f, "models:/{name}/{version}"),
            ModelRef::ByLatest { name } => write!(f, "models:/{name}/latest"),
            ModelRef::ByRun { run_id, path } => write!(f, "runs:/{run_id}/{path}"),
        }
    }
}

/// One column of a model signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub dtype: ValueType,
}

/// Input/output schema recorded with a model and enforced at prediction time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub inputs: Vec<ColumnSpec>,
    pub outputs: Vec<ColumnSpec>,
}

impl Signature {
    pub fn new(inputs: Vec<ColumnSpec>, outputs: Vec<ColumnSpec>) -> Self {
        Self { inputs, outputs }
    }

    /// Derive the schema from sample inputs and the predictions made on them.
    pub fn infer(inputs: &[Vec<Value>], outputs: &[Value]) -> DeltaResult<Self> {
        let first = inputs
            .first()
            .ok_or_else(|| DeltaError::invalid("cannot infer a signature from zero rows"))?;
        let mut columns: Vec<ValueType> = first.iter().map(Value::value_type).collect();
        for (idx, row) in inputs.iter().enumerate().skip(1) {
            if row.len() != columns.len() {
                return Err(DeltaError::invalid(format!(
                    "row {idx} has {} columns, row 0 has {}",
                    row.len(),
                    columns.len()
                )));
            }
            for (col, cell) in columns.iter_mut().zip(row) {
                *col = widen(*col, cell.value_type()).ok_or_else(|| {
                    DeltaError::invalid(format!("row {idx} mixes incompatible column types"))
                })?;
            }
        }

        let mut output = None;
        for cell in outputs {
            let kind = cell.value_type();
            output = Some(match output {
                None => kind,
                Some(prev) => widen(prev, kind)
                    .ok_or_else(|| DeltaError::invalid("outputs mix incompatible types"))?,
            });
        }

        Ok(Self {
            inputs: columns
                .into_iter()
                .map(|dtype| ColumnSpec { name: None, dtype })
                .collect(),
            outputs: output
                .map(|dtype| vec![ColumnSpec { name: None, dtype }])
                .unwrap_or_default(),
        })
    }

    /// Reject inputs whose shape or cell types disagree with the recorded schema.
    /// An empty input schema accepts anything.
    pub fn check_inputs(&self, rows: &[Vec<Value>]) -> DeltaResult<()> {
        if self.inputs.is_empty() {
            return Ok(());
        }
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != self.inputs.len() {
                return Err(DeltaError::SignatureMismatch(format!(
                    "row {idx} has {} columns, signature expects {}",
                    row.len(),
                    self.inputs.len()
                )));
            }
            for (col, (spec, cell)) in self.inputs.iter().zip(row).enumerate() {
                if !spec.dtype.accepts(cell) {
                    let label = spec.name.clone().unwrap_or_else(|| format!("#{col}"));
                    return Err(DeltaError::SignatureMismatch(format!(
                        "row {idx} column {label} expects {}, got {}",
                        spec.dtype.as_str(),
                        cell.value_type().as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn widen(a: ValueType, b: ValueType) -> Option<ValueType> {
    match (a, b) {
        (a, b) if a == b => Some(a),
        (ValueType::Int, ValueType::Float) | (ValueType::Float, ValueType::Int) => {
            Some(ValueType::Float)
        }
        _ => None,
    }
}

/// Serialized predictor plus the flavor that knows how to load it.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelArtifact {
    pub flavor: String,
    pub bytes: Vec<u8>,
}

impl ModelArtifact {
    pub fn new(flavor: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            flavor: flavor.into(),
            bytes,
        }
    }
}

/// Opaque storage address of an artefact, scoped to the run that logged it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactLocation(String);

impl ArtifactLocation {
    pub fn for_run(run: &RunId, path: &str) -> Self {
        Self(format!("runs/{run}/artifacts/{path}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Metadata stored next to artefact bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub flavor: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// Artefact as recorded on its run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedArtifact {
    pub location: ArtifactLocation,
    pub meta: ArtifactMeta,
}

/// Immutable ledger entry: version `version` of registered model `name`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    pub run_id: RunId,
    pub artifact_path: String,
    pub artifact: ArtifactLocation,
    pub flavor: String,
    pub digest: String,
    pub params: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    pub created_at: Timestamp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStage {
    Active,
    Archived,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunStatus {
    Running,
    Sealed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub value: f64,
    pub step: u64,
    pub timestamp: Timestamp,
}

/// Entries of a run's append-only event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        at: Timestamp,
    },
    Param {
        key: String,
        value: Value,
    },
    Metric {
        key: String,
        value: f64,
        step: u64,
        at: Timestamp,
    },
    Artifact {
        path: String,
        artifact: LoggedArtifact,
    },
    Registered {
        name: String,
        version: u32,
    },
    Sealed {
        at: Timestamp,
    },
}

/// State of a run, folded from its event log.
#[derive(Clone, Debug, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub started_at: Timestamp,
    pub status: RunStatus,
    pub params: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    pub artifacts: BTreeMap<String, LoggedArtifact>,
    pub registered: Option<(String, u32)>,
    pub sealed_at: Option<Timestamp>,
}

impl Run {
    pub(crate) fn replay(id: RunId, events: &[RunEvent]) -> DeltaResult<Self> {
        let started_at = match events.first() {
            Some(RunEvent::Started { at }) => *at,
            _ => {
                return Err(DeltaError::internal(format!(
                    "event log of run {id} does not start with `started`"
                )))
            }
        };
        let mut run = Run {
            id,
            started_at,
            status: RunStatus::Running,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            registered: None,
            sealed_at: None,
        };
        for event in &events[1..] {
            match event {
                RunEvent::Started { .. } => {}
                RunEvent::Param { key, value } => {
                    run.params.entry(key.clone()).or_insert_with(|| value.clone());
                }
                RunEvent::Metric {
                    key,
                    value,
                    step,
                    at,
                } => run.metrics.entry(key.clone()).or_default().push(MetricPoint {
                    value: *value,
                    step: *step,
                    timestamp: *at,
                }),
                RunEvent::Artifact { path, artifact } => {
                    run.artifacts
                        .entry(path.clone())
                        .or_insert_with(|| artifact.clone());
                }
                RunEvent::Registered { name, version } => {
                    run.registered = Some((name.clone(), *version));
                }
                RunEvent::Sealed { at } => {
                    run.status = RunStatus::Sealed;
                    run.sealed_at.get_or_insert(*at);
                }
            }
        }
        Ok(run)
    }

    pub fn is_sealed(&self) -> bool {
        self.status == RunStatus::Sealed
    }

    /// Most recently logged value per metric.
    pub fn latest_metrics(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .filter_map(|(key, points)| points.last().map(|p| (key.clone(), p.value)))
            .collect()
    }
}

/// Persistence contract for runs, artefacts and the version ledger.
pub trait ModelRepo: Send + Sync {
    fn append_run_events(&self, run: &RunId, events: &[RunEvent]) -> DeltaResult<()>;
    /// `None` when the run was never started.
    fn run_events(&self, run: &RunId) -> DeltaResult<Option<Vec<RunEvent>>>;
    /// Artefacts are written once; an occupied location is an error.
    fn put_artifact(
        &self,
        location: &ArtifactLocation,
        meta: &ArtifactMeta,
        bytes: &[u8],
    ) -> DeltaResult<()>;
    fn get_artifact(&self, location: &ArtifactLocation) -> DeltaResult<(ArtifactMeta, Vec<u8>)>;
    fn registered_names(&self) -> DeltaResult<Vec<String>>;
    /// Existing version numbers of `name`, ascending.
    fn versions(&self, name: &str) -> DeltaResult<Vec<u32>>;
    /// Claim `version.version` for `version.name`; `VersionConflict` if already taken.
    fn insert_version(&self, version: &ModelVersion) -> DeltaResult<()>;
    fn get_version(&self, name: &str, version: u32) -> DeltaResult<Option<ModelVersion>>;
    fn mark_archived(&self, name: &str, version: u32) -> DeltaResult<()>;
    fn is_archived(&self, name: &str, version: u32) -> DeltaResult<bool>;
}
