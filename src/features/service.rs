//! Feature serving: point-in-time historical joins, materialization and online reads.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::common::config::AppCfg;
use crate::common::error::{DeltaError, DeltaResult};
use crate::common::time::{self, Timestamp};
use crate::common::value::Value;

use super::domain::{
    EntityRow, FeatureRef, FeatureRepo, FeatureRow, FeatureTable, FeatureView, TableRow,
};
use super::repo_fs::FsFeatureRepo;

/// Historical rows of one view grouped by entity, each group sorted by timestamp
/// with ingestion order preserved among equal timestamps.
struct EntityIndex {
    rows: HashMap<String, Vec<FeatureRow>>,
}

impl EntityIndex {
    fn build(rows: Vec<FeatureRow>) -> Self {
        let mut grouped: HashMap<String, Vec<FeatureRow>> = HashMap::new();
        for row in rows {
            grouped.entry(row.entity.key()).or_default().push(row);
        }
        for group in grouped.values_mut() {
            group.sort_by_key(|r| r.timestamp);
        }
        Self { rows: grouped }
    }

    /// Latest row with `timestamp <= at`.
    fn as_of(&self, entity: &Value, at: Timestamp) -> Option<&FeatureRow> {
        let group = self.rows.get(&entity.key())?;
        let upto = group.partition_point(|r| r.timestamp <= at);
        upto.checked_sub(1).map(|idx| &group[idx])
    }

    /// Per entity with a row in `(after, until]`, its latest row `<= until`.
    fn latest_in_window(&self, after: Option<Timestamp>, until: Timestamp) -> Vec<&FeatureRow> {
        self.rows
            .values()
            .filter_map(|group| {
                let upto = group.partition_point(|r| r.timestamp <= until);
                let latest = group[..upto].last()?;
                match after {
                    Some(after) if latest.timestamp <= after => None,
                    _ => Some(latest),
                }
            })
            .collect()
    }
}

/// Entry point for feature reads and materialization. Construct once, share by reference.
pub struct FeatureStore<R = FsFeatureRepo> {
    repo: R,
    views: BTreeMap<String, FeatureView>,
    writer: Mutex<()>,
    lock_timeout: Duration,
}

impl FeatureStore<FsFeatureRepo> {
    /// Open the filesystem-backed store under `cfg.data_root`.
    pub fn open(cfg: &AppCfg, views: Vec<FeatureView>) -> DeltaResult<Self> {
        Self::with_repo(FsFeatureRepo::new(cfg), cfg, views)
    }
}

impl<R: FeatureRepo> FeatureStore<R> {
    pub fn with_repo(repo: R, cfg: &AppCfg, views: Vec<FeatureView>) -> DeltaResult<Self> {
        let mut registered = BTreeMap::new();
        for view in views {
            view.validate()?;
            let name = view.name.clone();
            if registered.insert(name.clone(), view).is_some() {
                return Err(DeltaError::invalid(format!(
                    "feature view `{name}` registered twice"
                )));
            }
        }
        info!(views = registered.len(), "feature store opened");
        Ok(Self {
            repo,
            views: registered,
            writer: Mutex::new(()),
            lock_timeout: cfg.lock_timeout(),
        })
    }

    pub fn feature_view(&self, name: &str) -> Option<&FeatureView> {
        self.views.get(name)
    }

    pub fn feature_views(&self) -> impl Iterator<Item = &FeatureView> {
        self.views.values()
    }

    /// Append historical rows to `view` after schema validation.
    pub fn ingest(&self, view: &str, rows: Vec<FeatureRow>) -> DeltaResult<usize> {
        let definition = self
            .views
            .get(view)
            .ok_or_else(|| DeltaError::invalid(format!("unknown feature view `{view}`")))?;
        for row in &rows {
            definition.check_row(row)?;
        }
        self.repo.append_rows(view, &rows)?;
        info!(view, rows = rows.len(), "feature rows ingested");
        Ok(rows.len())
    }

    /// Point-in-time join: each cell comes from the latest row at or before the
    /// requested timestamp, never after. Absent rows yield missing cells.
    pub fn get_historical_features(
        &self,
        entity_rows: &[(EntityRow, Timestamp)],
        feature_refs: &[&str],
    ) -> DeltaResult<FeatureTable> {
        let start = Instant::now();
        let columns = self.resolve_refs(feature_refs)?;

        let mut indexes: HashMap<String, EntityIndex> = HashMap::new();
        for column in &columns {
            if !indexes.contains_key(&column.view) {
                let rows = self.repo.scan_rows(&column.view)?;
                indexes.insert(column.view.clone(), EntityIndex::build(rows));
            }
        }

        let mut out = Vec::with_capacity(entity_rows.len());
        for (entity, at) in entity_rows {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                let view = &self.views[&column.view];
                let key = entity.join_key(view)?;
                let found = indexes[&column.view]
                    .as_of(key, *at)
                    .filter(|row| within_ttl(view, row.timestamp, *at));
                values.push(found.and_then(|row| row.values.get(&column.feature).cloned()));
            }
            out.push(TableRow {
                entity: entity.clone(),
                timestamp: Some(*at),
                values,
            });
        }

        debug!(
            rows = out.len(),
            columns = columns.len(),
            dur_ms = time::elapsed_ms(start) as u64,
            "historical features served"
        );
        Ok(FeatureTable { columns, rows: out })
    }

    /// Copy the latest row `<= end_date` of every entity that gained rows since the
    /// last watermark into the online table, then advance the watermark to `end_date`.
    /// Calling again with the same `end_date` changes nothing. On error the watermark
    /// stays put and the whole call must be retried.
    pub fn materialize_incremental(&self, end_date: Timestamp) -> DeltaResult<Timestamp> {
        let _guard = self.writer.try_lock_for(self.lock_timeout).ok_or_else(|| {
            DeltaError::unavailable("materialization already running in this process")
        })?;
        let _lease = self.repo.lease_writer()?;

        let since = self.repo.watermark()?;
        if let Some(watermark) = since {
            if end_date <= watermark {
                debug!(%watermark, %end_date, "nothing to materialize");
                return Ok(watermark);
            }
        }

        let copied = self.copy_window(since, end_date)?;
        self.repo.set_watermark(end_date)?;
        info!(copied, watermark = %end_date, "incremental materialization complete");
        Ok(end_date)
    }

    /// Backfill the online table from rows in `(start, end]` without touching the watermark.
    pub fn materialize(&self, start: Timestamp, end: Timestamp) -> DeltaResult<usize> {
        if end <= start {
            return Err(DeltaError::invalid(format!(
                "materialization window ({start}, {end}] is empty"
            )));
        }
        let _guard = self.writer.try_lock_for(self.lock_timeout).ok_or_else(|| {
            DeltaError::unavailable("materialization already running in this process")
        })?;
        let _lease = self.repo.lease_writer()?;

        let copied = self.copy_window(Some(start), end)?;
        info!(copied, %start, %end, "range materialization complete");
        Ok(copied)
    }

    /// Current online values. Unknown entities yield missing cells.
    pub fn get_online_features(
        &self,
        feature_refs: &[&str],
        entity_rows: &[EntityRow],
    ) -> DeltaResult<FeatureTable> {
        let start = Instant::now();
        let columns = self.resolve_refs(feature_refs)?;

        let mut out = Vec::with_capacity(entity_rows.len());
        for entity in entity_rows {
            let mut fetched: HashMap<&str, Option<FeatureRow>> = HashMap::new();
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                if !fetched.contains_key(column.view.as_str()) {
                    let view = &self.views[&column.view];
                    let row = self.repo.get_online(&view.name, entity.join_key(view)?)?;
                    fetched.insert(column.view.as_str(), row);
                }
                let value = fetched[column.view.as_str()]
                    .as_ref()
                    .and_then(|row| row.values.get(&column.feature).cloned());
                values.push(value);
            }
            out.push(TableRow {
                entity: entity.clone(),
                timestamp: None,
                values,
            });
        }

        debug!(
            rows = out.len(),
            dur_ms = time::elapsed_ms(start) as u64,
            "online features served"
        );
        Ok(FeatureTable { columns, rows: out })
    }

    fn resolve_refs(&self, feature_refs: &[&str]) -> DeltaResult<Vec<FeatureRef>> {
        feature_refs
            .iter()
            .map(|raw| {
                let parsed: FeatureRef = raw.parse()?;
                let declared = self
                    .views
                    .get(&parsed.view)
                    .is_some_and(|view| view.field(&parsed.feature).is_some());
                if declared {
                    Ok(parsed)
                } else {
                    Err(DeltaError::UnknownFeatureReference(raw.to_string()))
                }
            })
            .collect()
    }

    fn copy_window(&self, after: Option<Timestamp>, until: Timestamp) -> DeltaResult<usize> {
        let mut copied = 0;
        for view in self.views.values() {
            let index = EntityIndex::build(self.repo.scan_rows(&view.name)?);
            for row in index.latest_in_window(after, until) {
                let newer_online = self
                    .repo
                    .get_online(&view.name, &row.entity)?
                    .is_some_and(|current| current.timestamp > row.timestamp);
                if newer_online {
                    continue;
                }
                self.repo.put_online(&view.name, row)?;
                copied += 1;
            }
            debug!(view = %view.name, "view materialized");
        }
        Ok(copied)
    }
}

fn within_ttl(view: &FeatureView, row_ts: Timestamp, at: Timestamp) -> bool {
    match view.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
        Some(ttl) => row_ts >= at - ttl,
        None => true,
    }
}
