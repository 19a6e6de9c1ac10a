//! Structured logging on top of `tracing`.
//!
//! Services log through the `tracing` macros with `view`/`name`/`run_id`/`dur_ms`
//! fields; this module only installs the subscriber.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::common::config::AppCfg;
use crate::common::error::{DeltaError, DeltaResult};

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber. `RUST_LOG` wins over `cfg.log_level`.
pub fn init(cfg: &AppCfg) -> DeltaResult<()> {
    INIT.get_or_try_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_str()));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        let installed = if cfg.log_json {
            builder.json().flatten_event(true).try_init()
        } else {
            builder.with_line_number(true).try_init()
        };
        installed.map_err(|err| DeltaError::internal(format!("logging init: {err}")))
    })?;
    tracing::debug!(json = cfg.log_json, "logging initialised");
    Ok(())
}
