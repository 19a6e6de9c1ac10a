//! Feature store definitions and the repository contract behind them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::{DeltaError, DeltaResult};
use crate::common::lease::Lease;
use crate::common::time::Timestamp;
use crate::common::value::{Value, ValueType};

/// Parsed `"<view>.<feature>"` reference.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FeatureRef {
    pub view: String,
    pub feature: String,
}

impl FromStr for FeatureRef {
    type Err = DeltaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('.') {
            Some((view, feature)) if !view.is_empty() && !feature.is_empty() => Ok(Self {
                view: view.to_string(),
                feature: feature.to_string(),
            }),
            _ => Err(DeltaError::InvalidFeatureReference(raw.to_string())),
        }
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.view, self.feature)
    }
}

/// One typed column of a feature view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureField {
    pub name: String,
    pub dtype: ValueType,
}

/// Named group of features computed for one entity type. Fixed once the store is built.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureView {
    pub name: String,
    /// Join key the view is keyed on, e.g. `driver_id`.
    pub entity: String,
    pub schema: Vec<FeatureField>,
    /// Rows older than `requested_ts - ttl` are not served by historical lookups.
    pub ttl: Option<Duration>,
}

impl FeatureView {
    pub fn new(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            schema: Vec::new(),
            ttl: None,
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, dtype: ValueType) -> Self {
        self.schema.push(FeatureField {
            name: name.into(),
            dtype,
        });
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn field(&self, feature: &str) -> Option<&FeatureField> {
        self.schema.iter().find(|f| f.name == feature)
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.schema.iter().map(|f| f.name.as_str())
    }

    pub(crate) fn validate(&self) -> DeltaResult<()> {
        crate::common::ids::validate_name("feature view name", &self.name)?;
        if self.entity.is_empty() {
            return Err(DeltaError::invalid(format!(
                "feature view `{}` has no join key",
                self.name
            )));
        }
        let mut seen = BTreeSet::new();
        for field in &self.schema {
            if field.name.is_empty() || !seen.insert(field.name.as_str()) {
                return Err(DeltaError::invalid(format!(
                    "feature view `{}` declares feature `{}` twice or empty",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }

    /// Check a row against the view schema before it is persisted.
    pub(crate) fn check_row(&self, row: &FeatureRow) -> DeltaResult<()> {
        for (feature, value) in &row.values {
            let field = self.field(feature).ok_or_else(|| {
                DeltaError::invalid(format!(
                    "feature `{feature}` is not declared on view `{}`",
                    self.name
                ))
            })?;
            if !field.dtype.accepts(value) {
                return Err(DeltaError::invalid(format!(
                    "{}.{feature} expects {}, got {}",
                    self.name,
                    field.dtype.as_str(),
                    value.value_type().as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Entity key values supplied by the caller, e.g. `{"driver_id": 1001}`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EntityRow {
    pub keys: BTreeMap<String, Value>,
}

impl EntityRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for the common single-key case.
    pub fn single(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with_key(name, value)
    }

    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keys.insert(name.into(), value.into());
        self
    }

    pub(crate) fn join_key(&self, view: &FeatureView) -> DeltaResult<&Value> {
        self.keys.get(&view.entity).ok_or_else(|| {
            DeltaError::invalid(format!(
                "entity row lacks join key `{}` required by view `{}`",
                view.entity, view.name
            ))
        })
    }
}

/// Timestamped feature values for one entity of one view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub entity: Value,
    pub timestamp: Timestamp,
    pub values: BTreeMap<String, Value>,
}

impl FeatureRow {
    pub fn new(entity: impl Into<Value>, timestamp: Timestamp) -> Self {
        Self {
            entity: entity.into(),
            timestamp,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, feature: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(feature.into(), value.into());
        self
    }
}

/// One output row; `values` follows the table's column order and `None` marks a missing cell.
#[derive(Clone, Debug, PartialEq)]
pub struct TableRow {
    pub entity: EntityRow,
    pub timestamp: Option<Timestamp>,
    pub values: Vec<Option<Value>>,
}

/// Lookup result, one row per requested entity row, in request order.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureTable {
    pub columns: Vec<FeatureRef>,
    pub rows: Vec<TableRow>,
}

impl FeatureTable {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.to_string() == column)
    }

    /// Cell at `row` for a full reference such as `"driver.conv_rate"`.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.values.get(idx)?.as_ref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Dense model input; any missing cell is an error.
    pub fn to_inputs(&self) -> DeltaResult<Vec<Vec<Value>>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                row.values
                    .iter()
                    .zip(&self.columns)
                    .map(|(cell, column)| {
                        cell.clone().ok_or_else(|| {
                            DeltaError::invalid(format!("row {idx} is missing `{column}`"))
                        })
                    })
                    .collect()
            })
            .collect()
    }
}

/// Persistence contract for historical rows, the online table and the watermark.
pub trait FeatureRepo: Send + Sync {
    fn append_rows(&self, view: &str, rows: &[FeatureRow]) -> DeltaResult<()>;
    /// Every historical row of `view` in ingestion order.
    fn scan_rows(&self, view: &str) -> DeltaResult<Vec<FeatureRow>>;
    fn put_online(&self, view: &str, row: &FeatureRow) -> DeltaResult<()>;
    /// Constant-time lookup of the current online row.
    fn get_online(&self, view: &str, entity: &Value) -> DeltaResult<Option<FeatureRow>>;
    fn watermark(&self) -> DeltaResult<Option<Timestamp>>;
    fn set_watermark(&self, at: Timestamp) -> DeltaResult<()>;
    /// Exclusive right to materialize, across processes where the backend supports it.
    fn lease_writer(&self) -> DeltaResult<Lease>;
}
