//! Filesystem-backed feature repository rooted at `cfg.data_root/features`.
//!
//! Historical rows are append-only JSON lines per view. The online table keeps
//! one file per entity so lookups never scan.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::config::AppCfg;
use crate::common::error::DeltaResult;
use crate::common::fsio;
use crate::common::ids;
use crate::common::lease::Lease;
use crate::common::time::Timestamp;
use crate::common::value::Value;

use super::domain::{FeatureRepo, FeatureRow};

#[derive(Serialize, Deserialize)]
struct WatermarkRecord {
    watermark: Timestamp,
}

pub struct FsFeatureRepo {
    root: PathBuf,
}

impl FsFeatureRepo {
    pub fn new(cfg: &AppCfg) -> Self {
        Self {
            root: cfg.data_root.join("features"),
        }
    }

    fn offline_path(&self, view: &str) -> PathBuf {
        self.root.join("offline").join(format!("{view}.jsonl"))
    }

    fn online_path(&self, view: &str, entity: &Value) -> PathBuf {
        self.root
            .join("online")
            .join(view)
            .join(format!("{}.json", ids::path_key(&entity.key())))
    }

    fn watermark_path(&self) -> PathBuf {
        self.root.join("watermark.json")
    }
}

impl FeatureRepo for FsFeatureRepo {
    fn append_rows(&self, view: &str, rows: &[FeatureRow]) -> DeltaResult<()> {
        fsio::append_lines(&self.offline_path(view), rows)
    }

    fn scan_rows(&self, view: &str) -> DeltaResult<Vec<FeatureRow>> {
        Ok(fsio::read_lines(&self.offline_path(view))?.unwrap_or_default())
    }

    fn put_online(&self, view: &str, row: &FeatureRow) -> DeltaResult<()> {
        let body = serde_json::to_vec(row)?;
        fsio::write_atomic(&self.online_path(view, &row.entity), &body)?;
        Ok(())
    }

    fn get_online(&self, view: &str, entity: &Value) -> DeltaResult<Option<FeatureRow>> {
        fsio::read_json(&self.online_path(view, entity))
    }

    fn watermark(&self) -> DeltaResult<Option<Timestamp>> {
        let record: Option<WatermarkRecord> = fsio::read_json(&self.watermark_path())?;
        Ok(record.map(|r| r.watermark))
    }

    fn set_watermark(&self, at: Timestamp) -> DeltaResult<()> {
        let body = serde_json::to_vec(&WatermarkRecord { watermark: at })?;
        fsio::write_atomic(&self.watermark_path(), &body)?;
        Ok(())
    }

    fn lease_writer(&self) -> DeltaResult<Lease> {
        Lease::acquire(self.root.join("materialize.lease"))
    }
}
