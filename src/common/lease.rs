//! Single-writer lease backed by an OS advisory lock on a lease file.
//!
//! The lock belongs to the open handle, so a holder that crashes releases it with
//! its process. The file stays in place between holders and only records who took
//! the lease last.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::error::{DeltaError, DeltaResult};
use crate::common::fsio;
use crate::common::ids;
use crate::common::time::{self, Timestamp};

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    holder: String,
    acquired_at: Timestamp,
}

/// Held until dropped.
#[derive(Debug)]
pub struct Lease {
    held: Option<(PathBuf, File)>,
}

impl Lease {
    /// Take the lease at `path` without waiting; a live holder yields `StorageUnavailable`.
    pub fn acquire(path: PathBuf) -> DeltaResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(DeltaError::unavailable(format!(
                    "lease {} is held by another writer",
                    path.display()
                )));
            }
            return Err(err.into());
        }

        let record = LeaseRecord {
            holder: ids::fresh_id(),
            acquired_at: time::now(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        serde_json::to_writer(&mut file, &record)?;
        file.flush()?;
        debug!(lease = %path.display(), holder = %record.holder, "lease acquired");
        Ok(Self {
            held: Some((path, file)),
        })
    }

    /// Holder id recorded by the most recent acquisition, if any.
    pub fn last_holder(path: &Path) -> DeltaResult<Option<String>> {
        let record: Option<LeaseRecord> = fsio::read_json(path).unwrap_or(None);
        Ok(record.map(|r| r.holder))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some((path, file)) = self.held.take() {
            if let Err(err) = FileExt::unlock(&file) {
                warn!(lease = %path.display(), error = %err, "failed to release lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("materialize.lease");
        let first = Lease::acquire(path.clone()).unwrap();
        let holder = Lease::last_holder(&path).unwrap();
        assert!(holder.is_some());

        let err = Lease::acquire(path.clone()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(Lease::last_holder(&path).unwrap(), holder);

        drop(first);
        let _again = Lease::acquire(path.clone()).unwrap();
        assert_ne!(Lease::last_holder(&path).unwrap(), holder);
    }

    #[test]
    fn leftover_file_from_a_crashed_holder_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("materialize.lease");
        let old = LeaseRecord {
            holder: "crashed".into(),
            acquired_at: time::now() - chrono::Duration::hours(2),
        };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();

        let _lease = Lease::acquire(path.clone()).unwrap();
        assert_ne!(Lease::last_holder(&path).unwrap().as_deref(), Some("crashed"));
    }

    #[test]
    fn racing_writers_never_hold_the_lease_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("materialize.lease");
        let old = LeaseRecord {
            holder: "crashed".into(),
            acquired_at: time::now() - chrono::Duration::hours(2),
        };

        for _ in 0..50 {
            fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
            let barrier = Barrier::new(4);
            let holders = AtomicUsize::new(0);
            let overlap = AtomicUsize::new(0);
            std::thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(|| {
                        barrier.wait();
                        if let Ok(lease) = Lease::acquire(path.clone()) {
                            if holders.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlap.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::sleep(std::time::Duration::from_millis(2));
                            holders.fetch_sub(1, Ordering::SeqCst);
                            drop(lease);
                        }
                    });
                }
            });
            assert_eq!(overlap.load(Ordering::SeqCst), 0);
        }
    }
}
