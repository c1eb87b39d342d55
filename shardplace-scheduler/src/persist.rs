//! Scheduler persistence
//!
//! The coordinator saves the active scheduler list, with the arguments
//! needed to rebuild each one, after every add or remove and restores it
//! on start.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use shardplace_core::{Result, ScheduleError};

/// One active scheduler as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedScheduler {
    pub name: String,
    pub scheduler_type: String,
    pub args: Vec<String>,
}

/// Durable storage for the scheduler list
pub trait ConfigStore: Send + Sync {
    fn load_schedulers(&self) -> Result<Vec<PersistedScheduler>>;

    /// Replace the stored list
    fn save_schedulers(&self, schedulers: &[PersistedScheduler]) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryConfigStore {
    schedulers: Mutex<Vec<PersistedScheduler>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_schedulers(&self) -> Result<Vec<PersistedScheduler>> {
        Ok(self.schedulers.lock().clone())
    }

    fn save_schedulers(&self, schedulers: &[PersistedScheduler]) -> Result<()> {
        *self.schedulers.lock() = schedulers.to_vec();
        Ok(())
    }
}

/// JSON file store. Writes go to a sibling temp file that is then renamed
/// over the target, so readers never see a partial list.
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ScheduleError {
    ScheduleError::Persist(format!("{}: {}", path.display(), err))
}

impl ConfigStore for FileConfigStore {
    fn load_schedulers(&self) -> Result<Vec<PersistedScheduler>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted schedulers");
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_error(&self.path, e)),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    fn save_schedulers(&self, schedulers: &[PersistedScheduler]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let data = serde_json::to_vec_pretty(schedulers)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data).map_err(|e| io_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))?;
        debug!(path = %self.path.display(), count = schedulers.len(), "Schedulers persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplace_core::ErrorKind;

    fn make_entry(name: &str, args: &[&str]) -> PersistedScheduler {
        PersistedScheduler {
            name: name.to_string(),
            scheduler_type: "evict-leader".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_memory_store_replaces() {
        let store = MemoryConfigStore::new();
        assert!(store.load_schedulers().unwrap().is_empty());
        store.save_schedulers(&[make_entry("a", &["1"]), make_entry("b", &["2"])]).unwrap();
        store.save_schedulers(&[make_entry("b", &["2"])]).unwrap();
        assert_eq!(store.load_schedulers().unwrap(), vec![make_entry("b", &["2"])]);
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("schedulers.json"));
        assert!(store.load_schedulers().unwrap().is_empty());

        let entries = vec![make_entry("evict-leader-scheduler-1", &["1"])];
        store.save_schedulers(&entries).unwrap();
        assert!(!dir.path().join("schedulers.tmp").exists());

        let reopened = FileConfigStore::new(store.path().to_path_buf());
        assert_eq!(reopened.load_schedulers().unwrap(), entries);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedulers.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = FileConfigStore::new(path).load_schedulers().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
