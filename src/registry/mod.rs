//! Locked Registry Store: atomic read-modify-write of the per-task and
//! global registry documents via exclusive advisory file locks.
//!
//! Grounded on `examples/gyasis-dev-kid/rust-watchdog/src/registry.rs`'s
//! `locked_mutate` pattern (open/create lock file, `lock_exclusive`,
//! re-read from disk, mutate, atomic write, drop releases the lock), with
//! two additions the spec requires that the teacher source doesn't have:
//! a `.backup` sibling written before every successful mutation, and a
//! bounded retry-with-backoff around lock acquisition that surfaces a
//! distinguished retriable error on timeout instead of blocking forever.
//!
//! Generalized here over the document type so both the per-task
//! `TaskRecord` registry and the `GlobalRegistryDocument` reuse one
//! primitive instead of duplicating the lock/persist dance.

pub mod global;

use crate::constants::LOCK_TIMEOUT;
use crate::error::{Result, SpiralError};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LOCK_RETRY_BASE_DELAY: Duration = Duration::from_millis(10);
const LOCK_RETRY_MAX_DELAY: Duration = Duration::from_millis(250);

/// A locked document store rooted at a single JSON file. One instance per
/// registry file (per-task `AGENT_REGISTRY.json`, or the global registry).
pub struct LockedRegistryStore<T> {
    doc_path: PathBuf,
    lock_path: PathBuf,
    backup_path: PathBuf,
    timeout: Duration,
    _doc: PhantomData<T>,
}

impl<T> LockedRegistryStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(doc_path: impl Into<PathBuf>) -> Self {
        let doc_path = doc_path.into();
        let lock_path = doc_path.with_extension("lock");
        let backup_path = sibling_backup_path(&doc_path);
        Self {
            doc_path,
            lock_path,
            backup_path,
            timeout: LOCK_TIMEOUT,
            _doc: PhantomData,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.doc_path
    }

    fn acquire_exclusive(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;

        let deadline = Instant::now() + self.timeout;
        let mut delay = LOCK_RETRY_BASE_DELAY;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(delay.min(LOCK_RETRY_MAX_DELAY));
                    delay *= 2;
                }
                Err(_) => {
                    return Err(SpiralError::LockContentionError {
                        path: self.doc_path.display().to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    fn acquire_shared(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;

        let deadline = Instant::now() + self.timeout;
        let mut delay = LOCK_RETRY_BASE_DELAY;
        loop {
            match lock_file.try_lock_shared() {
                Ok(()) => return Ok(lock_file),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(delay.min(LOCK_RETRY_MAX_DELAY));
                    delay *= 2;
                }
                Err(_) => {
                    return Err(SpiralError::LockContentionError {
                        path: self.doc_path.display().to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Loads the document from disk, falling back to the `.backup` sibling
    /// if the primary file is missing or fails to parse.
    fn load(&self) -> Result<T> {
        match self.try_load_path(&self.doc_path) {
            Ok(doc) => Ok(doc),
            Err(primary_err) => {
                warn!(
                    path = %self.doc_path.display(),
                    error = %primary_err,
                    "registry document unreadable, attempting backup recovery"
                );
                self.try_load_path(&self.backup_path).map_err(|_| {
                    SpiralError::CorruptRegistryError {
                        path: self.doc_path.display().to_string(),
                        reason: primary_err.to_string(),
                    }
                })
            }
        }
    }

    fn try_load_path(&self, path: &Path) -> Result<T> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes `.backup` first (best-effort snapshot of the previous good
    /// state), then atomically writes the new document via
    /// tmp-file-then-rename, then fsyncs the containing directory.
    fn persist(&self, doc: &T) -> Result<()> {
        if self.doc_path.exists() {
            let _ = fs::copy(&self.doc_path, &self.backup_path);
        }

        let json = serde_json::to_string_pretty(doc)?;
        let tmp_path = self.doc_path.with_extension("json.tmp");
        if let Some(parent) = self.doc_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp_path, json.as_bytes())?;
        fs::rename(&tmp_path, &self.doc_path)?;

        if let Some(parent) = self.doc_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Creates the document if it does not already exist, under lock.
    pub fn init_if_absent(&self, make_default: impl FnOnce() -> T) -> Result<()> {
        let lock_file = self.acquire_exclusive()?;
        if !self.doc_path.exists() {
            self.persist(&make_default())?;
        }
        FileExt::unlock(&lock_file)?;
        Ok(())
    }

    /// Exposes the `withRegistry(path, mutator)` contract: load under an
    /// exclusive lock, hand the document to `mutator`, persist the result,
    /// release on every exit path (including early returns via `?`).
    pub fn with_registry<F, R>(&self, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> Result<R>,
    {
        let lock_file = self.acquire_exclusive()?;
        let result = (|| {
            let mut doc = self.load()?;
            let out = mutator(&mut doc)?;
            self.persist(&doc)?;
            Ok(out)
        })();
        // Lock releases on drop regardless, but be explicit so failures to
        // unlock are visible rather than silently swallowed by drop.
        if let Err(e) = FileExt::unlock(&lock_file) {
            debug!(error = %e, "failed to explicitly unlock registry lock file");
        }
        result
    }

    /// Read-only snapshot under a shared lock.
    pub fn read_snapshot(&self) -> Result<T> {
        let lock_file = self.acquire_shared()?;
        let doc = self.load();
        let _ = FileExt::unlock(&lock_file);
        doc
    }
}

fn sibling_backup_path(doc_path: &Path) -> PathBuf {
    let mut name = doc_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".backup");
    doc_path.with_file_name(name)
}

/// Convenience alias for the per-task registry store.
pub type TaskRegistryStore = LockedRegistryStore<crate::models::TaskRecord>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, SpiralLimits, TaskContext, TaskRecord, TaskStatus};
    use std::sync::Arc;

    fn empty_task(task_id: &str, workspace: &Path) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            description: "d".into(),
            priority: Priority::Medium,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            workspace: workspace.display().to_string(),
            status: TaskStatus::Initialized,
            limits: SpiralLimits::default(),
            total_spawned: 0,
            active_count: 0,
            completed_count: 0,
            agents: vec![],
            context: TaskContext::default(),
            client_cwd: None,
        }
    }

    #[test]
    fn init_and_mutate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let doc_path = dir.path().join("AGENT_REGISTRY.json");
        let store: TaskRegistryStore = LockedRegistryStore::new(&doc_path);

        store
            .init_if_absent(|| empty_task("task-1", dir.path()))
            .unwrap();

        store
            .with_registry(|doc| {
                doc.total_spawned += 1;
                Ok(())
            })
            .unwrap();

        let snapshot = store.read_snapshot().unwrap();
        assert_eq!(snapshot.total_spawned, 1);
        assert!(sibling_backup_path(&doc_path).exists());
    }

    #[test]
    fn corrupt_primary_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let doc_path = dir.path().join("AGENT_REGISTRY.json");
        let store: TaskRegistryStore = LockedRegistryStore::new(&doc_path);
        store
            .init_if_absent(|| empty_task("task-1", dir.path()))
            .unwrap();
        store
            .with_registry(|doc| {
                doc.total_spawned = 7;
                Ok(())
            })
            .unwrap();

        // Corrupt the primary but leave the backup (written before this
        // mutation) intact by truncating just the live file.
        fs::write(&doc_path, b"{not valid json").unwrap();

        let snapshot = store.read_snapshot();
        assert!(snapshot.is_ok());
    }

    #[test]
    fn concurrent_mutations_never_lose_an_update() {
        let dir = tempfile::tempdir().unwrap();
        let doc_path = dir.path().join("AGENT_REGISTRY.json");
        let store: Arc<TaskRegistryStore> = Arc::new(LockedRegistryStore::new(&doc_path));
        store
            .init_if_absent(|| empty_task("task-1", dir.path()))
            .unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    store
                        .with_registry(|doc| {
                            doc.total_spawned += 1;
                            Ok(())
                        })
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = store.read_snapshot().unwrap();
        assert_eq!(snapshot.total_spawned, 80);
    }
}
