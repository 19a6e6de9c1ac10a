//! Runtime configuration layered from defaults, an optional file and the environment.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::common::error::DeltaResult;

/// Snapshot of configuration values consumed by the core.
#[derive(Clone, Debug, Deserialize)]
pub struct AppCfg {
    pub data_root: PathBuf,
    pub log_level: String,
    pub log_json: bool,
    pub lock_timeout_ms: u64,
    pub version_retries: u32,
}

impl AppCfg {
    /// Defaults, then the file named by `DELTA1_CONFIG_FILE`, then `DELTA1_*` variables.
    pub fn load() -> DeltaResult<Self> {
        let mut builder = Self::defaults()?;
        if let Ok(file) = env::var("DELTA1_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DELTA1")
                .separator("__")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Defaults overlaid with a single configuration file.
    pub fn from_file(path: &Path) -> DeltaResult<Self> {
        let builder = Self::defaults()?.add_source(config::File::from(path));
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Default configuration rooted at an explicit directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: root.into(),
            log_level: "info".to_string(),
            log_json: false,
            lock_timeout_ms: 2_000,
            version_retries: 3,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    fn defaults() -> DeltaResult<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("data_root", "./data")?
            .set_default("log_level", "info")?
            .set_default("log_json", false)?
            .set_default("lock_timeout_ms", 2_000_i64)?
            .set_default("version_retries", 3_i64)?)
    }
}
