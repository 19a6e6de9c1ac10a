//! Model registry: run tracking, version allocation and reference resolution.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::config::AppCfg;
use crate::common::error::{DeltaError, DeltaResult};
use crate::common::ids;
use crate::common::time;
use crate::common::value::Value;
use crate::inference::domain::{Flavor, LoadedModel};
use crate::inference::linear::LinearFlavor;

use super::domain::{
    ArtifactLocation, ArtifactMeta, LoggedArtifact, ModelArtifact, ModelRef, ModelRepo,
    ModelVersion, Run, RunEvent, RunId, Signature, VersionStage,
};
use super::repo_fs::FsModelRepo;

/// Model payload for [`ModelRegistry::log_model`].
#[derive(Clone, Debug)]
pub struct LogModel {
    pub artifact_path: String,
    pub artifact: ModelArtifact,
    pub signature: Option<Signature>,
    /// When set, the artefact is registered as the next version of this name.
    pub registered_name: Option<String>,
}

impl LogModel {
    pub fn new(artifact_path: impl Into<String>, artifact: ModelArtifact) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            artifact,
            signature: None,
            registered_name: None,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn registered_as(mut self, name: impl Into<String>) -> Self {
        self.registered_name = Some(name.into());
        self
    }
}

/// Everything one training run publishes, recorded by [`ModelRegistry::log`] in one call.
#[derive(Clone, Debug)]
pub struct LogRequest {
    pub params: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, f64>,
    pub model: LogModel,
}

impl LogRequest {
    pub fn new(model: LogModel) -> Self {
        Self {
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            model,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// Single source of truth for "which artefact is version N of model M".
pub struct ModelRegistry<R = FsModelRepo> {
    repo: R,
    flavors: HashMap<String, Arc<dyn Flavor>>,
    allocation: Mutex<()>,
    lock_timeout: Duration,
    version_retries: u32,
}

impl ModelRegistry<FsModelRepo> {
    /// Open the filesystem-backed registry under `cfg.data_root`.
    pub fn open(cfg: &AppCfg) -> Self {
        Self::with_repo(FsModelRepo::new(cfg), cfg)
    }
}

impl<R: ModelRepo> ModelRegistry<R> {
    pub fn with_repo(repo: R, cfg: &AppCfg) -> Self {
        let mut registry = Self {
            repo,
            flavors: HashMap::new(),
            allocation: Mutex::new(()),
            lock_timeout: cfg.lock_timeout(),
            version_retries: cfg.version_retries.max(1),
        };
        registry.register_flavor(LinearFlavor);
        registry
    }

    /// Make artefacts of another flavor loadable. Replaces a flavor of the same name.
    pub fn register_flavor(&mut self, flavor: impl Flavor + 'static) {
        self.flavors.insert(flavor.name().to_string(), Arc::new(flavor));
    }

    // ── Runs ────────────────────────────────────────────────────────

    pub fn begin_run(&self) -> DeltaResult<Run> {
        let id = RunId::generate();
        let events = [RunEvent::Started { at: time::now() }];
        self.repo.append_run_events(&id, &events)?;
        info!(run_id = %id, "run started");
        Run::replay(id, &events)
    }

    pub fn get_run(&self, run: &RunId) -> DeltaResult<Run> {
        let events = self
            .repo
            .run_events(run)?
            .ok_or_else(|| DeltaError::UnknownRun(run.to_string()))?;
        Run::replay(run.clone(), &events)
    }

    /// Record a parameter. Parameters are write-once: repeating the same value is
    /// a no-op, a different value is rejected.
    pub fn log_param(&self, run: &RunId, key: &str, value: impl Into<Value>) -> DeltaResult<()> {
        self.log_params(run, [(key.to_string(), value.into())])
    }

    pub fn log_params<K, V>(
        &self,
        run: &RunId,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> DeltaResult<()>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let state = self.open_run(run)?;
        let events = param_events(&state, params)?;
        if events.is_empty() {
            return Ok(());
        }
        self.repo.append_run_events(run, &events)?;
        debug!(run_id = %run, params = events.len(), "params logged");
        Ok(())
    }

    /// Append a metric observation; history is kept, the latest value wins in summaries.
    pub fn log_metric(&self, run: &RunId, key: &str, value: f64) -> DeltaResult<()> {
        let step = self
            .open_run(run)?
            .metrics
            .get(key)
            .map_or(0, |points| points.len() as u64);
        self.log_metric_at(run, key, value, step)
    }

    pub fn log_metric_at(&self, run: &RunId, key: &str, value: f64, step: u64) -> DeltaResult<()> {
        self.open_run(run)?;
        let event = metric_event(key, value, step)?;
        self.repo.append_run_events(run, &[event])?;
        debug!(run_id = %run, metric = key, value, step, "metric logged");
        Ok(())
    }

    pub fn log_metrics<K>(
        &self,
        run: &RunId,
        metrics: impl IntoIterator<Item = (K, f64)>,
    ) -> DeltaResult<()>
    where
        K: Into<String>,
    {
        let state = self.open_run(run)?;
        let events = metric_events(&state, metrics, false)?;
        if events.is_empty() {
            return Ok(());
        }
        self.repo.append_run_events(run, &events)?;
        debug!(run_id = %run, metrics = events.len(), "metrics logged");
        Ok(())
    }

    /// Store the artefact under the run and, when a name is given, register it as
    /// that name's next version. A run registers at most one version.
    ///
    /// Logging the same bytes at the same path again is a no-op, so a call that
    /// failed with a retryable error can be repeated as is.
    pub fn log_model(&self, run: &RunId, model: LogModel) -> DeltaResult<Option<ModelVersion>> {
        let state = self.open_run(run)?;
        let plan = self.plan_model(run, &state, model)?;
        self.commit_model(run, plan, Vec::new())
    }

    /// Seal the run; later logging into it fails.
    pub fn end_run(&self, run: &RunId) -> DeltaResult<Run> {
        self.open_run(run)?;
        self.repo
            .append_run_events(run, &[RunEvent::Sealed { at: time::now() }])?;
        info!(run_id = %run, "run sealed");
        self.get_run(run)
    }

    /// Record params, metrics and the model of one run, then seal it.
    ///
    /// Everything is validated before the run log is touched; a rejected request
    /// leaves the run as it was. Params, metrics and the artefact entry land in one
    /// append. Repeating a request that failed with a retryable error records
    /// nothing twice.
    pub fn log(&self, run: &RunId, request: LogRequest) -> DeltaResult<Option<ModelVersion>> {
        let start = Instant::now();
        let state = self.open_run(run)?;
        let mut events = param_events(&state, request.params)?;
        let plan = self.plan_model(run, &state, request.model)?;
        // A repeat of an attempt that already stored the artefact also stored its metrics.
        events.extend(metric_events(&state, request.metrics, plan.recorded)?);

        let version = self.commit_model(run, plan, events)?;
        self.end_run(run)?;
        info!(
            run_id = %run,
            version = version.as_ref().map(|v| v.version),
            dur_ms = time::elapsed_ms(start) as u64,
            "run logged"
        );
        Ok(version)
    }

    // ── Versions ────────────────────────────────────────────────────

    pub fn registered_models(&self) -> DeltaResult<Vec<String>> {
        self.repo.registered_names()
    }

    pub fn get_model_version(&self, name: &str, version: u32) -> DeltaResult<ModelVersion> {
        self.repo
            .get_version(name, version)?
            .ok_or_else(|| DeltaError::UnknownModelReference(format!("models:/{name}/{version}")))
    }

    /// Highest existing version, read fresh from the ledger on every call.
    pub fn latest_version(&self, name: &str) -> DeltaResult<ModelVersion> {
        let latest = self.repo.versions(name)?.last().copied().ok_or_else(|| {
            DeltaError::UnknownModelReference(format!("models:/{name}/latest"))
        })?;
        self.get_model_version(name, latest)
    }

    pub fn list_versions(&self, name: &str) -> DeltaResult<Vec<(ModelVersion, VersionStage)>> {
        self.repo
            .versions(name)?
            .into_iter()
            .map(|v| Ok((self.get_model_version(name, v)?, self.stage(name, v)?)))
            .collect()
    }

    pub fn stage(&self, name: &str, version: u32) -> DeltaResult<VersionStage> {
        if self.repo.is_archived(name, version)? {
            Ok(VersionStage::Archived)
        } else {
            Ok(VersionStage::Active)
        }
    }

    /// Move a version to `Archived`. The ledger entry itself is left untouched.
    pub fn archive(&self, name: &str, version: u32) -> DeltaResult<()> {
        self.get_model_version(name, version)?;
        self.repo.mark_archived(name, version)?;
        info!(model = name, version, "model version archived");
        Ok(())
    }

    // ── Resolution ──────────────────────────────────────────────────

    /// Parse `reference` and load the artefact it names.
    pub fn resolve(&self, reference: &str) -> DeltaResult<LoadedModel> {
        self.resolve_ref(&reference.parse()?)
    }

    pub fn resolve_ref(&self, reference: &ModelRef) -> DeltaResult<LoadedModel> {
        let start = Instant::now();
        let (run_id, location, expected_digest, version) = match reference {
            ModelRef::ByVersion { name, version } => {
                let found = self.get_model_version(name, *version)?;
                (found.run_id.clone(), found.artifact.clone(), found.digest.clone(), Some(found))
            }
            ModelRef::ByLatest { name } => {
                let found = self.latest_version(name)?;
                (found.run_id.clone(), found.artifact.clone(), found.digest.clone(), Some(found))
            }
            ModelRef::ByRun { run_id, path } => {
                let run = self.get_run(run_id)?;
                let logged = run
                    .artifacts
                    .get(path)
                    .ok_or_else(|| DeltaError::UnknownModelReference(reference.to_string()))?;
                (run_id.clone(), logged.location.clone(), logged.meta.digest.clone(), None)
            }
        };

        let (meta, bytes) = self.repo.get_artifact(&location)?;
        if ids::digest_hex(&bytes) != expected_digest {
            return Err(DeltaError::internal(format!(
                "artifact {} does not match its recorded digest",
                location.as_str()
            )));
        }
        let flavor = self.flavors.get(&meta.flavor).ok_or_else(|| {
            DeltaError::internal(format!("no loader for flavor `{}`", meta.flavor))
        })?;
        let predictor = flavor.load(&bytes)?;

        let signature = match &version {
            Some(v) => v.signature.clone(),
            None => meta.signature.clone(),
        };
        debug!(
            model = %reference,
            run_id = %run_id,
            dur_ms = time::elapsed_ms(start) as u64,
            "model resolved"
        );
        Ok(LoadedModel {
            reference: reference.clone(),
            run_id,
            version,
            signature,
            predictor,
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    fn open_run(&self, run: &RunId) -> DeltaResult<Run> {
        let state = self.get_run(run)?;
        if state.is_sealed() {
            return Err(DeltaError::invalid(format!("run {run} is sealed")));
        }
        Ok(state)
    }

    /// Check a model payload against the run without writing anything.
    fn plan_model(&self, run: &RunId, state: &Run, model: LogModel) -> DeltaResult<ModelPlan> {
        ids::validate_relative_path("artifact path", &model.artifact_path)?;
        if !self.flavors.contains_key(&model.artifact.flavor) {
            return Err(DeltaError::invalid(format!(
                "no loader for flavor `{}`",
                model.artifact.flavor
            )));
        }

        let meta = ArtifactMeta {
            flavor: model.artifact.flavor.clone(),
            digest: ids::digest_hex(&model.artifact.bytes),
            size: model.artifact.bytes.len() as u64,
            signature: model.signature.clone(),
        };
        let recorded = match state.artifacts.get(&model.artifact_path) {
            Some(existing) if existing.meta == meta => true,
            Some(_) => {
                return Err(DeltaError::invalid(format!(
                    "run {run} already holds a different artifact at `{}`",
                    model.artifact_path
                )))
            }
            None => false,
        };

        let mut registered = None;
        if let Some(name) = &model.registered_name {
            ids::validate_name("model name", name)?;
            match &state.registered {
                None => {}
                // Same bytes registered under the same name by an earlier attempt.
                Some((existing, version)) if recorded && existing == name => {
                    registered = Some(*version);
                }
                Some((existing, version)) => {
                    return Err(DeltaError::invalid(format!(
                        "run {run} already registered {existing} version {version}"
                    )))
                }
            }
        }

        Ok(ModelPlan {
            location: ArtifactLocation::for_run(run, &model.artifact_path),
            path: model.artifact_path,
            meta,
            bytes: model.artifact.bytes,
            registered_name: model.registered_name,
            recorded,
            registered,
        })
    }

    /// Write the artefact, append `events` plus the artefact entry in one batch,
    /// then register the version if asked to.
    fn commit_model(
        &self,
        run: &RunId,
        plan: ModelPlan,
        mut events: Vec<RunEvent>,
    ) -> DeltaResult<Option<ModelVersion>> {
        let logged = LoggedArtifact {
            location: plan.location,
            meta: plan.meta,
        };
        if !plan.recorded {
            self.store_artifact(&logged, &plan.bytes)?;
            events.push(RunEvent::Artifact {
                path: plan.path.clone(),
                artifact: logged.clone(),
            });
        }
        if !events.is_empty() {
            self.repo.append_run_events(run, &events)?;
            info!(
                run_id = %run,
                path = %plan.path,
                size = logged.meta.size,
                events = events.len(),
                "artifact logged"
            );
        }

        let Some(name) = plan.registered_name else {
            return Ok(None);
        };
        if let Some(version) = plan.registered {
            return self.get_model_version(&name, version).map(Some);
        }
        self.allocate_version(&name, run, &plan.path, &logged).map(Some)
    }

    /// `put_artifact`, except that bytes already stored with the same digest by an
    /// interrupted earlier attempt count as written.
    fn store_artifact(&self, logged: &LoggedArtifact, bytes: &[u8]) -> DeltaResult<()> {
        let Err(err) = self.repo.put_artifact(&logged.location, &logged.meta, bytes) else {
            return Ok(());
        };
        match self.repo.get_artifact(&logged.location) {
            Ok((stored, _)) if stored == logged.meta => {
                debug!(location = logged.location.as_str(), "artifact already stored");
                Ok(())
            }
            _ => Err(err),
        }
    }

    /// Read the current maximum, claim max + 1, re-read on conflict. Serialised in
    /// process by `allocation`; across processes the ledger's create-if-absent
    /// write decides the winner. The run's `registered` entry is written under the
    /// same guard.
    fn allocate_version(
        &self,
        name: &str,
        run: &RunId,
        artifact_path: &str,
        logged: &LoggedArtifact,
    ) -> DeltaResult<ModelVersion> {
        let _guard = self.allocation.try_lock_for(self.lock_timeout).ok_or_else(|| {
            DeltaError::unavailable(format!("timed out waiting to allocate a version of `{name}`"))
        })?;

        // Params and metrics logged so far, including this call's.
        let current = self.get_run(run)?;
        if let Some((existing, version)) = &current.registered {
            return Err(DeltaError::invalid(format!(
                "run {run} already registered {existing} version {version}"
            )));
        }
        let metrics = current.latest_metrics();
        let params = current.params;

        for attempt in 1..=self.version_retries {
            let next = self.repo.versions(name)?.last().copied().unwrap_or(0) + 1;
            let record = ModelVersion {
                name: name.to_string(),
                version: next,
                run_id: run.clone(),
                artifact_path: artifact_path.to_string(),
                artifact: logged.location.clone(),
                flavor: logged.meta.flavor.clone(),
                digest: logged.meta.digest.clone(),
                params: params.clone(),
                metrics: metrics.clone(),
                signature: logged.meta.signature.clone(),
                created_at: time::now(),
            };
            match self.repo.insert_version(&record) {
                Ok(()) => {
                    self.repo.append_run_events(
                        run,
                        &[RunEvent::Registered {
                            name: record.name.clone(),
                            version: next,
                        }],
                    )?;
                    info!(model = name, version = next, run_id = %run, "model version registered");
                    return Ok(record);
                }
                Err(DeltaError::VersionConflict { version, .. }) => {
                    warn!(
                        model = name,
                        version,
                        attempt,
                        "version claimed concurrently, re-reading ledger"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(DeltaError::unavailable(format!(
            "could not allocate a version of `{name}` after {} attempts",
            self.version_retries
        )))
    }
}

/// Validated model payload, ready to commit.
struct ModelPlan {
    path: String,
    location: ArtifactLocation,
    meta: ArtifactMeta,
    bytes: Vec<u8>,
    registered_name: Option<String>,
    /// The run already holds these exact bytes at `path`.
    recorded: bool,
    /// Version this run already registered under `registered_name`.
    registered: Option<u32>,
}

fn check_key(kind: &str, key: &str) -> DeltaResult<()> {
    if key.is_empty() || key.len() > 250 {
        return Err(DeltaError::invalid(format!("{kind} key `{key}` is empty or too long")));
    }
    Ok(())
}

/// Events for params not yet on the run. Identical repeats are dropped, conflicting
/// values rejected.
fn param_events<K, V>(
    state: &Run,
    params: impl IntoIterator<Item = (K, V)>,
) -> DeltaResult<Vec<RunEvent>>
where
    K: Into<String>,
    V: Into<Value>,
{
    let mut events = Vec::new();
    let mut pending: BTreeMap<String, Value> = BTreeMap::new();
    for (key, value) in params {
        let key = key.into();
        let value = value.into();
        check_key("param", &key)?;
        if let Value::Float(v) = value {
            if !v.is_finite() {
                return Err(DeltaError::invalid(format!("param `{key}` is not finite")));
            }
        }
        match state.params.get(&key).or_else(|| pending.get(&key)) {
            Some(existing) if *existing == value => continue,
            Some(existing) => {
                return Err(DeltaError::invalid(format!(
                    "param `{key}` already logged as {existing}, refusing {value}"
                )))
            }
            None => {}
        }
        pending.insert(key.clone(), value.clone());
        events.push(RunEvent::Param { key, value });
    }
    Ok(events)
}

/// Events for new metric points, numbered after the run's existing history. With
/// `skip_repeats`, a value equal to the key's latest point is dropped.
fn metric_events<K>(
    state: &Run,
    metrics: impl IntoIterator<Item = (K, f64)>,
    skip_repeats: bool,
) -> DeltaResult<Vec<RunEvent>>
where
    K: Into<String>,
{
    let mut steps: HashMap<String, u64> = HashMap::new();
    let mut events = Vec::new();
    for (key, value) in metrics {
        let key = key.into();
        let history = state.metrics.get(&key);
        let latest = history.and_then(|points| points.last()).map(|p| p.value);
        if skip_repeats && latest == Some(value) {
            continue;
        }
        let step = steps
            .entry(key.clone())
            .or_insert_with(|| history.map_or(0, |points| points.len() as u64));
        events.push(metric_event(&key, value, *step)?);
        *step += 1;
    }
    Ok(events)
}

fn metric_event(key: &str, value: f64, step: u64) -> DeltaResult<RunEvent> {
    check_key("metric", key)?;
    if !value.is_finite() {
        return Err(DeltaError::invalid(format!("metric `{key}` is not finite")));
    }
    Ok(RunEvent::Metric {
        key: key.to_string(),
        value,
        step,
        at: time::now(),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::linear::LinearModel;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const NAME: &str = "sk-learn-random-forest-reg-model";

    fn linear() -> ModelArtifact {
        LinearModel::new(vec![1.0, 2.0], 0.5).to_artifact().unwrap()
    }

    fn request() -> LogRequest {
        LogRequest::new(LogModel::new("sklearn-model", linear()).registered_as(NAME))
            .param("max_depth", 2)
            .metric("mse", 12.3)
    }

    fn publish<R: ModelRepo>(registry: &ModelRegistry<R>) -> DeltaResult<ModelVersion> {
        let run = registry.begin_run()?;
        registry
            .log(&run.id, request())?
            .ok_or_else(|| DeltaError::internal("nothing registered"))
    }

    #[test]
    fn logged_run_resolves_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));

        let created = publish(&registry).unwrap();
        assert_eq!(created.version, 1);

        let loaded = registry.resolve(&format!("models:/{NAME}/1")).unwrap();
        let version = loaded.version.as_ref().unwrap();
        assert_eq!(version.params["max_depth"], Value::Int(2));
        assert_eq!(version.metrics["mse"], 12.3);
        assert_eq!(loaded.run_id, created.run_id);
        assert_eq!(
            loaded.predict(&[vec![Value::Float(1.0), Value::Int(1)]]).unwrap(),
            vec![Value::Float(3.5)]
        );

        let err = registry.resolve(&format!("models:/{NAME}/2")).unwrap_err();
        assert!(matches!(err, DeltaError::UnknownModelReference(_)));
        let err = registry.resolve("models:/never-registered/latest").unwrap_err();
        assert!(matches!(err, DeltaError::UnknownModelReference(_)));
        let err = registry.resolve("models:/m/zero").unwrap_err();
        assert!(matches!(err, DeltaError::InvalidModelReference(_)));
    }

    #[test]
    fn latest_follows_the_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));
        for _ in 0..3 {
            publish(&registry).unwrap();
        }

        let latest = registry.resolve(&format!("models:/{NAME}/latest")).unwrap();
        assert_eq!(latest.version.map(|v| v.version), Some(3));

        registry.archive(NAME, 3).unwrap();
        assert_eq!(registry.stage(NAME, 3).unwrap(), VersionStage::Archived);
        assert_eq!(registry.latest_version(NAME).unwrap().version, 3);
        let stages: Vec<_> = registry
            .list_versions(NAME)
            .unwrap()
            .into_iter()
            .map(|(v, stage)| (v.version, stage))
            .collect();
        assert_eq!(
            stages,
            vec![
                (1, VersionStage::Active),
                (2, VersionStage::Active),
                (3, VersionStage::Archived)
            ]
        );
        assert_eq!(registry.registered_models().unwrap(), vec![NAME]);
        assert!(registry.archive(NAME, 9).is_err());
    }

    #[test]
    fn concurrent_logs_on_a_shared_registry_get_distinct_versions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ModelRegistry::open(&AppCfg::with_root(dir.path())));

        let mut versions: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..5)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    s.spawn(move || publish(&*registry).unwrap().version)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn two_registries_on_one_root_never_share_a_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppCfg::with_root(dir.path());
        cfg.version_retries = 10;
        let a = ModelRegistry::open(&cfg);
        let b = ModelRegistry::open(&cfg);

        let mut versions: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..5)
                .map(|i| {
                    let registry = if i % 2 == 0 { &a } else { &b };
                    s.spawn(move || publish(registry).unwrap().version)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    /// Loses its first claim to a rival writer, or every claim while `always` is set.
    struct Contended {
        inner: FsModelRepo,
        conflicts: AtomicU32,
        always: AtomicBool,
    }

    impl ModelRepo for Contended {
        fn append_run_events(&self, run: &RunId, events: &[RunEvent]) -> DeltaResult<()> {
            self.inner.append_run_events(run, events)
        }
        fn run_events(&self, run: &RunId) -> DeltaResult<Option<Vec<RunEvent>>> {
            self.inner.run_events(run)
        }
        fn put_artifact(
            &self,
            location: &ArtifactLocation,
            meta: &ArtifactMeta,
            bytes: &[u8],
        ) -> DeltaResult<()> {
            self.inner.put_artifact(location, meta, bytes)
        }
        fn get_artifact(
            &self,
            location: &ArtifactLocation,
        ) -> DeltaResult<(ArtifactMeta, Vec<u8>)> {
            self.inner.get_artifact(location)
        }
        fn registered_names(&self) -> DeltaResult<Vec<String>> {
            self.inner.registered_names()
        }
        fn versions(&self, name: &str) -> DeltaResult<Vec<u32>> {
            self.inner.versions(name)
        }
        fn insert_version(&self, version: &ModelVersion) -> DeltaResult<()> {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            if self.always.load(Ordering::SeqCst) {
                return Err(DeltaError::VersionConflict {
                    name: version.name.clone(),
                    version: version.version,
                });
            }
            if self.conflicts.load(Ordering::SeqCst) == 1 {
                // A rival takes the number first.
                self.inner.insert_version(version)?;
                return Err(DeltaError::VersionConflict {
                    name: version.name.clone(),
                    version: version.version,
                });
            }
            self.inner.insert_version(version)
        }
        fn get_version(&self, name: &str, version: u32) -> DeltaResult<Option<ModelVersion>> {
            self.inner.get_version(name, version)
        }
        fn mark_archived(&self, name: &str, version: u32) -> DeltaResult<()> {
            self.inner.mark_archived(name, version)
        }
        fn is_archived(&self, name: &str, version: u32) -> DeltaResult<bool> {
            self.inner.is_archived(name, version)
        }
    }

    fn contended(cfg: &AppCfg, always: bool) -> ModelRegistry<Contended> {
        let repo = Contended {
            inner: FsModelRepo::new(cfg),
            conflicts: AtomicU32::new(0),
            always: AtomicBool::new(always),
        };
        ModelRegistry::with_repo(repo, cfg)
    }

    #[test]
    fn lost_claim_is_retried_with_the_next_number() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppCfg::with_root(dir.path());
        let registry = contended(&cfg, false);

        assert_eq!(publish(&registry).unwrap().version, 2);
        assert_eq!(registry.repo.conflicts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exhausted_retries_surface_as_storage_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppCfg::with_root(dir.path());
        let registry = contended(&cfg, true);

        let err = publish(&registry).unwrap_err();
        assert!(matches!(err, DeltaError::StorageUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(registry.repo.conflicts.load(Ordering::SeqCst), 3);
        assert!(registry.repo.versions(NAME).unwrap().is_empty());
    }

    #[test]
    fn retried_log_registers_once_without_duplicating_history() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppCfg::with_root(dir.path());
        let registry = contended(&cfg, true);
        let run = registry.begin_run().unwrap().id;

        let err = registry.log(&run, request()).unwrap_err();
        assert!(err.is_retryable());
        assert!(!registry.get_run(&run).unwrap().is_sealed());

        registry.repo.always.store(false, Ordering::SeqCst);
        let created = registry.log(&run, request()).unwrap().unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(created.params["max_depth"], Value::Int(2));
        assert_eq!(created.metrics["mse"], 12.3);

        let state = registry.get_run(&run).unwrap();
        assert!(state.is_sealed());
        assert_eq!(state.metrics["mse"].len(), 1);
        assert_eq!(state.artifacts.len(), 1);
        assert_eq!(state.registered, Some((NAME.to_string(), 1)));
    }

    #[test]
    fn rejected_log_leaves_the_run_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));
        let run = registry.begin_run().unwrap().id;
        registry.log_param(&run, "lr", 0.1).unwrap();
        let before = registry.get_run(&run).unwrap();

        let unknown_flavor = LogRequest::new(
            LogModel::new("sklearn-model", ModelArtifact::new("onnx", vec![0])).registered_as(NAME),
        )
        .param("max_depth", 2)
        .metric("mse", 12.3);
        let bad_path = LogRequest::new(LogModel::new("../escape", linear()))
            .param("max_depth", 2)
            .metric("mse", 12.3);
        let param_conflict = request().param("lr", 0.2);
        let bad_metric = request().metric("rmse", f64::INFINITY);
        let bad_name = LogRequest::new(LogModel::new("m", linear()).registered_as("../m"))
            .metric("mse", 12.3);

        for rejected in [unknown_flavor, bad_path, param_conflict, bad_metric, bad_name] {
            let err = registry.log(&run, rejected).unwrap_err();
            assert!(matches!(err, DeltaError::InvalidInput(_)), "{err:?}");
            assert_eq!(registry.get_run(&run).unwrap(), before);
        }
        assert!(registry.registered_models().unwrap().is_empty());

        registry
            .log_model(&run, LogModel::new("first", linear()).registered_as(NAME))
            .unwrap();
        let registered = registry.get_run(&run).unwrap();
        let second = LogRequest::new(LogModel::new("second", linear()).registered_as(NAME))
            .metric("mse", 1.0);
        let err = registry.log(&run, second).unwrap_err();
        assert!(matches!(err, DeltaError::InvalidInput(_)));
        assert_eq!(registry.get_run(&run).unwrap(), registered);
    }

    #[test]
    fn racing_registrations_on_one_run_yield_one_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));
        let run = registry.begin_run().unwrap().id;

        let outcomes: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = ["a", "b", "c", "d"]
                .into_iter()
                .map(|path| {
                    let (registry, run) = (&registry, &run);
                    s.spawn(move || {
                        registry
                            .log_model(run, LogModel::new(path, linear()).registered_as(NAME))
                            .is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert_eq!(registry.repo.versions(NAME).unwrap(), vec![1]);
        assert_eq!(registry.get_run(&run).unwrap().registered, Some((NAME.to_string(), 1)));
    }

    #[test]
    fn params_are_write_once_and_sealed_runs_refuse_writes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));
        let run = registry.begin_run().unwrap().id;

        registry.log_param(&run, "max_depth", 2).unwrap();
        registry.log_param(&run, "max_depth", 2).unwrap();
        let err = registry.log_param(&run, "max_depth", 3).unwrap_err();
        assert!(matches!(err, DeltaError::InvalidInput(_)));
        assert!(registry.log_metric(&run, "mse", f64::NAN).is_err());

        registry.log_metric(&run, "mse", 14.0).unwrap();
        registry.log_metric(&run, "mse", 12.3).unwrap();
        let state = registry.end_run(&run).unwrap();
        assert!(state.is_sealed());
        assert_eq!(state.metrics["mse"].iter().map(|p| p.step).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(state.latest_metrics()["mse"], 12.3);

        let err = registry.log_metric(&run, "mse", 1.0).unwrap_err();
        assert!(matches!(err, DeltaError::InvalidInput(_)));
        let err = registry.get_run(&RunId::generate()).unwrap_err();
        assert!(matches!(err, DeltaError::UnknownRun(_)));
    }

    #[test]
    fn unregistered_artifacts_resolve_through_their_run() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));
        let run = registry.begin_run().unwrap().id;

        let rows = vec![vec![Value::Float(1.0), Value::Float(1.0)]];
        let signature = Signature::infer(&rows, &[Value::Float(3.5)]).unwrap();
        let logged = registry
            .log_model(&run, LogModel::new("sklearn-model", linear()).with_signature(signature))
            .unwrap();
        assert!(logged.is_none());
        assert!(registry.registered_models().unwrap().is_empty());

        let loaded = registry.resolve(&format!("runs:/{run}/sklearn-model")).unwrap();
        assert!(loaded.version.is_none());
        assert_eq!(loaded.predict(&rows).unwrap(), vec![Value::Float(3.5)]);
        let err = loaded.predict(&[vec![Value::from("x"), Value::Float(1.0)]]).unwrap_err();
        assert!(matches!(err, DeltaError::SignatureMismatch(_)));

        let err = registry.resolve(&format!("runs:/{run}/other")).unwrap_err();
        assert!(matches!(err, DeltaError::UnknownModelReference(_)));
        let err = registry.resolve("runs:/no-such-run/sklearn-model").unwrap_err();
        assert!(matches!(err, DeltaError::UnknownRun(_)));
    }

    #[test]
    fn a_run_registers_at_most_one_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));
        let run = registry.begin_run().unwrap().id;

        registry
            .log_model(&run, LogModel::new("a", linear()).registered_as(NAME))
            .unwrap();
        let err = registry
            .log_model(&run, LogModel::new("b", linear()).registered_as(NAME))
            .unwrap_err();
        assert!(matches!(err, DeltaError::InvalidInput(_)));
        assert_eq!(
            registry.get_run(&run).unwrap().registered,
            Some((NAME.to_string(), 1))
        );

        let unknown = ModelArtifact::new("onnx", vec![0]);
        assert!(registry.log_model(&run, LogModel::new("c", unknown)).is_err());
    }

    #[test]
    fn tampered_artifacts_are_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::open(&AppCfg::with_root(dir.path()));
        let created = publish(&registry).unwrap();

        let bin = created
            .artifact
            .as_str()
            .split('/')
            .fold(dir.path().join("registry"), |p, s| p.join(s))
            .join("model.bin");
        std::fs::write(&bin, b"{\"weights\":[9.0],\"bias\":0.0}").unwrap();

        let err = registry.resolve(&format!("models:/{NAME}/1")).unwrap_err();
        assert!(matches!(err, DeltaError::Internal(_)));
    }
}
