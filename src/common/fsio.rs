//! Filesystem primitives shared by the repositories.
//!
//! Writes go through a staging file next to the target so readers never observe
//! a partially written record. Staging files start with `.` and are ignored by
//! directory listings.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::error::{DeltaError, DeltaResult};
use crate::common::ids;

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", ids::fresh_id()))
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Replace `path` with `bytes` in one step.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    ensure_parent(path)?;
    let staging = staging_path(path);
    write_file(&staging, bytes)?;
    fs::rename(&staging, path).map_err(|err| {
        let _ = fs::remove_file(&staging);
        err
    })
}

/// Create `path` only if it does not exist yet. Fails with
/// `ErrorKind::AlreadyExists` when another writer got there first.
pub fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    ensure_parent(path)?;
    let staging = staging_path(path);
    write_file(&staging, bytes)?;
    let linked = fs::hard_link(&staging, path);
    let _ = fs::remove_file(&staging);
    linked
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Deserialize a JSON file if present.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> DeltaResult<Option<T>> {
    match read_optional(path)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Append one JSON document per item, newline separated.
pub fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> DeltaResult<()> {
    ensure_parent(path)?;
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

/// Read every JSON line of `path`; `None` when the file does not exist.
pub fn read_lines<T: DeserializeOwned>(path: &Path) -> DeltaResult<Option<Vec<T>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line).map_err(|err| {
            DeltaError::internal(format!("{}:{}: {err}", path.display(), idx + 1))
        })?;
        out.push(item);
    }
    Ok(Some(out))
}

/// Names of visible entries in `dir`; empty when the directory does not exist.
pub fn list_names(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut names = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
