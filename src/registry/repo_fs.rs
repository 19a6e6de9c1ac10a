//! Filesystem repository for runs, artefacts and the version ledger.
//!
//! Version entries are claimed with create-if-absent semantics, so two processes
//! racing for the same number cannot both succeed.

use std::io;
use std::path::PathBuf;

use crate::common::config::AppCfg;
use crate::common::error::{DeltaError, DeltaResult};
use crate::common::fsio;

use super::domain::{ArtifactLocation, ArtifactMeta, ModelRepo, ModelVersion, RunEvent, RunId};

const VERSION_EXT: &str = ".json";
const ARCHIVED_EXT: &str = ".archived";

/// Persist registry state under `cfg.data_root/registry`.
pub struct FsModelRepo {
    root: PathBuf,
}

impl FsModelRepo {
    pub fn new(cfg: &AppCfg) -> Self {
        Self {
            root: cfg.data_root.join("registry"),
        }
    }

    fn run_log(&self, run: &RunId) -> PathBuf {
        self.root
            .join("runs")
            .join(run.as_str())
            .join("events.jsonl")
    }

    fn artifact_dir(&self, location: &ArtifactLocation) -> PathBuf {
        location
            .as_str()
            .split('/')
            .fold(self.root.clone(), |dir, segment| dir.join(segment))
    }

    fn versions_dir(&self, name: &str) -> PathBuf {
        self.root.join("models").join(name).join("versions")
    }

    fn version_file(&self, name: &str, version: u32, ext: &str) -> PathBuf {
        self.versions_dir(name).join(format!("{version:08}{ext}"))
    }
}

impl ModelRepo for FsModelRepo {
    fn append_run_events(&self, run: &RunId, events: &[RunEvent]) -> DeltaResult<()> {
        fsio::append_lines(&self.run_log(run), events)
    }

    fn run_events(&self, run: &RunId) -> DeltaResult<Option<Vec<RunEvent>>> {
        fsio::read_lines(&self.run_log(run))
    }

    fn put_artifact(
        &self,
        location: &ArtifactLocation,
        meta: &ArtifactMeta,
        bytes: &[u8],
    ) -> DeltaResult<()> {
        let dir = self.artifact_dir(location);
        let occupied = |err: io::Error| -> DeltaError {
            if err.kind() == io::ErrorKind::AlreadyExists {
                DeltaError::invalid(format!(
                    "artifact location {} is already used",
                    location.as_str()
                ))
            } else {
                err.into()
            }
        };
        // Bytes first: a present model.json implies complete bytes.
        fsio::write_new(&dir.join("model.bin"), bytes).map_err(occupied)?;
        fsio::write_new(&dir.join("model.json"), &serde_json::to_vec_pretty(meta)?)
            .map_err(occupied)?;
        Ok(())
    }

    fn get_artifact(&self, location: &ArtifactLocation) -> DeltaResult<(ArtifactMeta, Vec<u8>)> {
        let dir = self.artifact_dir(location);
        let meta: ArtifactMeta = fsio::read_json(&dir.join("model.json"))?.ok_or_else(|| {
            DeltaError::internal(format!("artifact {} has no metadata", location.as_str()))
        })?;
        let bytes = fsio::read_optional(&dir.join("model.bin"))?.ok_or_else(|| {
            DeltaError::internal(format!("artifact {} has no payload", location.as_str()))
        })?;
        Ok((meta, bytes))
    }

    fn registered_names(&self) -> DeltaResult<Vec<String>> {
        Ok(fsio::list_names(&self.root.join("models"))?)
    }

    fn versions(&self, name: &str) -> DeltaResult<Vec<u32>> {
        let mut versions: Vec<u32> = fsio::list_names(&self.versions_dir(name))?
            .iter()
            .filter_map(|file| file.strip_suffix(VERSION_EXT)?.parse().ok())
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    fn insert_version(&self, version: &ModelVersion) -> DeltaResult<()> {
        let path = self.version_file(&version.name, version.version, VERSION_EXT);
        let body = serde_json::to_vec_pretty(version)?;
        match fsio::write_new(&path, &body) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(DeltaError::VersionConflict {
                    name: version.name.clone(),
                    version: version.version,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get_version(&self, name: &str, version: u32) -> DeltaResult<Option<ModelVersion>> {
        fsio::read_json(&self.version_file(name, version, VERSION_EXT))
    }

    fn mark_archived(&self, name: &str, version: u32) -> DeltaResult<()> {
        let marker = self.version_file(name, version, ARCHIVED_EXT);
        match fsio::write_new(&marker, b"") {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn is_archived(&self, name: &str, version: u32) -> DeltaResult<bool> {
        Ok(fsio::read_optional(&self.version_file(name, version, ARCHIVED_EXT))?.is_some())
    }
}
