//! Identifier, digest and naming helpers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::common::error::{DeltaError, DeltaResult};

/// Fresh random identifier (32 lowercase hex characters).
pub fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Encode an arbitrary key into a single filesystem-safe path component.
pub fn path_key(raw: &str) -> String {
    hex::encode(raw.as_bytes())
}

/// Names become directory names: ASCII alphanumerics plus `-`, `_` and `.`,
/// not starting with `.`.
pub fn validate_name(kind: &str, name: &str) -> DeltaResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DeltaError::invalid(format!("invalid {kind} `{name}`")))
    }
}

/// Relative artefact paths: one or more valid names joined by `/`.
pub fn validate_relative_path(kind: &str, path: &str) -> DeltaResult<()> {
    if path.is_empty() {
        return Err(DeltaError::invalid(format!("empty {kind}")));
    }
    path.split('/').try_for_each(|segment| validate_name(kind, segment))
}
