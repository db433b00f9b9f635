//! Snapshot triggers: SAVE, BGSAVE, LASTSAVE and the auto-save
//! schedule.
//!
//! Every save follows the same protocol: capture a point-in-time view
//! of the keyspace (a structural clone under the read lock), serialize
//! it, write to `<path>.tmp`, fsync, rename. The rename is what keeps
//! the previous dump intact when a save fails partway.
//!
//! BGSAVE hands the captured view to `spawn_blocking` so serialization
//! and file I/O never sit on the command path. On completion the
//! change counter is decremented by the captured count and `lastsave`
//! is stamped; on failure neither happens, so the next auto-save tick
//! retries.

use crate::persistence::rdb;
use crate::storage::StorageEngine;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("ERR Background save already in progress")]
    AlreadyInProgress,

    #[error("ERR {0}")]
    Io(#[from] std::io::Error),
}

/// One `(seconds, changes)` pair of the auto-save schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePoint {
    pub seconds: u64,
    pub changes: u64,
}

/// The default schedule: after 900 s if 1 change, 300 s if 10,
/// 60 s if 10000.
pub fn default_save_points() -> Vec<SavePoint> {
    vec![
        SavePoint {
            seconds: 900,
            changes: 1,
        },
        SavePoint {
            seconds: 300,
            changes: 10,
        },
        SavePoint {
            seconds: 60,
            changes: 10_000,
        },
    ]
}

/// Parses a `CONFIG SET save "900 1 300 10"` style schedule. An empty
/// string disables auto-save; an odd token count is an error.
pub fn parse_save_points(text: &str) -> Option<Vec<SavePoint>> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Some(Vec::new());
    }
    if tokens.len() % 2 != 0 {
        return None;
    }
    let mut points = Vec::with_capacity(tokens.len() / 2);
    for pair in tokens.chunks(2) {
        points.push(SavePoint {
            seconds: pair[0].parse().ok()?,
            changes: pair[1].parse().ok()?,
        });
    }
    Some(points)
}

/// Renders a schedule back to its CONFIG GET representation.
pub fn format_save_points(points: &[SavePoint]) -> String {
    points
        .iter()
        .map(|p| format!("{} {}", p.seconds, p.changes))
        .collect::<Vec<_>>()
        .join(" ")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Coordinates snapshot writes and remembers when the last one
/// finished.
pub struct SnapshotManager {
    lastsave: AtomicU64,
    in_progress: AtomicBool,
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self {
            lastsave: AtomicU64::new(now_secs()),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Unix timestamp (seconds) of the last completed save.
    pub fn lastsave(&self) -> u64 {
        self.lastsave.load(Ordering::Relaxed)
    }

    /// Seconds since the last completed save.
    pub fn elapsed_since_save(&self) -> u64 {
        now_secs().saturating_sub(self.lastsave())
    }

    pub fn save_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Relaxed)
    }

    /// Synchronous SAVE: serialize, write, fsync, rename, all on the
    /// calling task.
    pub fn save(&self, engine: &StorageEngine, path: &Path) -> Result<(), PersistError> {
        let view = engine.snapshot();
        let captured = engine.changes();
        let bytes = rdb::serialize(&view);
        write_atomic(path, &bytes)?;
        engine.subtract_changes(captured);
        self.lastsave.store(now_secs(), Ordering::Relaxed);
        info!(path = %path.display(), keys = view.len(), "snapshot saved");
        Ok(())
    }

    /// BGSAVE: captures the view now, writes it on a blocking worker.
    /// Returns as soon as the worker is spawned; only one background
    /// save runs at a time.
    pub fn bgsave(
        self: &Arc<Self>,
        engine: &Arc<StorageEngine>,
        path: PathBuf,
    ) -> Result<(), PersistError> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(PersistError::AlreadyInProgress);
        }

        let view = engine.snapshot();
        let captured = engine.changes();
        let manager = Arc::clone(self);
        let engine = Arc::clone(engine);

        tokio::spawn(async move {
            let keys = view.len();
            let result = tokio::task::spawn_blocking(move || {
                let bytes = rdb::serialize(&view);
                write_atomic(&path, &bytes)
            })
            .await;

            match result {
                Ok(Ok(())) => {
                    engine.subtract_changes(captured);
                    manager.lastsave.store(now_secs(), Ordering::Relaxed);
                    info!(keys, "background save finished");
                }
                Ok(Err(err)) => error!(error = %err, "background save failed"),
                Err(err) => error!(error = %err, "background save worker panicked"),
            }
            manager.in_progress.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Whether any schedule point is due given the current change
    /// count.
    pub fn autosave_due(&self, points: &[SavePoint], changes: u64) -> bool {
        let elapsed = self.elapsed_since_save();
        points
            .iter()
            .any(|p| changes >= p.changes && elapsed >= p.seconds)
    }
}

/// Writes `bytes` to `path` atomically: tmp file, fsync, rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("rdb.tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads the snapshot at `path` into a fresh entry list. A missing
/// file means "start empty"; a corrupt file is an error the caller
/// treats as fatal at startup.
pub fn load_file(path: &Path) -> Result<Option<Vec<(bytes::Bytes, crate::storage::Entry)>>, rdb::RdbError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(_) => return Err(rdb::RdbError::UnexpectedEof),
    };
    rdb::parse(&bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn save_points_parse_and_format() {
        let points = parse_save_points("900 1 300 10").unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(
            points[0],
            SavePoint {
                seconds: 900,
                changes: 1
            }
        );
        assert_eq!(format_save_points(&points), "900 1 300 10");

        assert_eq!(parse_save_points("").unwrap(), Vec::new());
        assert!(parse_save_points("900").is_none());
        assert!(parse_save_points("900 x").is_none());
    }

    #[test]
    fn synchronous_save_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        let engine = StorageEngine::new();
        engine.set(b("k"), b("v"), Default::default());
        engine.mark_write();

        let manager = SnapshotManager::new();
        manager.save(&engine, &path).unwrap();
        assert_eq!(engine.changes(), 0);

        let entries = load_file(&path).unwrap().unwrap();
        let reloaded = StorageEngine::new();
        reloaded.load(entries);
        assert_eq!(reloaded.get(b"k").unwrap(), Some(b("v")));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_file(&dir.path().join("absent.rdb")).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        fs::write(&path, b"REDIS0011garbage").unwrap();
        assert!(load_file(&path).is_err());
    }

    #[tokio::test]
    async fn bgsave_writes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        let engine = Arc::new(StorageEngine::new());
        engine.set(b("k"), b("v"), Default::default());
        engine.mark_write();

        let manager = Arc::new(SnapshotManager::new());
        let before = manager.lastsave();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        manager.bgsave(&engine, path.clone()).unwrap();
        for _ in 0..100 {
            if !manager.save_in_progress() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(path.exists());
        assert_eq!(engine.changes(), 0);
        assert!(manager.lastsave() > before);
    }

    #[tokio::test]
    async fn concurrent_bgsave_rejected() {
        let engine = Arc::new(StorageEngine::new());
        let manager = Arc::new(SnapshotManager::new());
        // Force the flag: a second BGSAVE while one runs must fail.
        manager.in_progress.store(true, Ordering::SeqCst);
        let err = manager
            .bgsave(&engine, PathBuf::from("/tmp/never-written.rdb"))
            .unwrap_err();
        assert!(matches!(err, PersistError::AlreadyInProgress));
        manager.in_progress.store(false, Ordering::SeqCst);
    }

    #[test]
    fn autosave_due_checks_both_conditions() {
        let manager = SnapshotManager::new();
        let points = vec![SavePoint {
            seconds: 0,
            changes: 5,
        }];

        assert!(!manager.autosave_due(&points, 4));
        assert!(manager.autosave_due(&points, 5));

        // Not enough elapsed time.
        let strict = vec![SavePoint {
            seconds: 3600,
            changes: 1,
        }];
        assert!(!manager.autosave_due(&strict, 100));
    }

    #[test]
    fn failed_save_preserves_previous_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        let engine = StorageEngine::new();
        engine.set(b("k"), b("v1"), Default::default());
        let manager = SnapshotManager::new();
        manager.save(&engine, &path).unwrap();
        let original = fs::read(&path).unwrap();

        // A save into an unwritable location fails without touching
        // the existing dump.
        let bogus = Path::new("/proc/definitely/not/writable/dump.rdb");
        assert!(manager.save(&engine, bogus).is_err());
        assert_eq!(fs::read(&path).unwrap(), original);
    }
}
