//! Snapshot-file backed store.
//!
//! Durability model: after each successful transaction the complete state is
//! serialized to `<path>.tmp`, flushed, and renamed over `<path>`. A crash
//! leaves either the previous or the new snapshot on disk, never a mix. If the
//! snapshot cannot be written the transaction fails and memory is unchanged.
//!
//! Ownership: a store holds an exclusive advisory lock on `<path>.lock` for
//! its whole lifetime. A second opener of the same path, in this process or
//! another, gets `StoreError::Locked` instead of a private copy that would
//! silently overwrite the first owner's commits.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::memory::InMemoryStore;
use crate::r#trait::RecordStore;

#[derive(Debug)]
pub struct FileStore<S> {
    path: PathBuf,
    inner: InMemoryStore<S>,
    // Released when the file handle closes.
    _owner: File,
}

impl<S> FileStore<S>
where
    S: Clone + Default + Serialize + DeserializeOwned,
{
    /// Open the snapshot at `path`, starting from `S::default()` if it does not
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let owner = take_ownership(&path)?;

        let state = if path.exists() {
            let state = load_snapshot(&path).map_err(|e| StoreError::Snapshot(format!("{e:#}")))?;
            info!(path = %path.display(), "loaded store snapshot");
            state
        } else {
            S::default()
        };

        Ok(Self {
            path,
            inner: InMemoryStore::new(state),
            _owner: owner,
        })
    }
}

/// Lock `<path>.lock` exclusively without blocking.
fn take_ownership(path: &Path) -> Result<File, StoreError> {
    let lock_path = path.with_extension("lock");
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StoreError::Io(format!("open {}: {e}", lock_path.display())))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(StoreError::Locked(path.display().to_string()))
        }
        Err(e) => Err(StoreError::Io(format!("lock {}: {e}", lock_path.display()))),
    }
}

impl<S> RecordStore for FileStore<S>
where
    S: Clone + Serialize + Send + Sync,
{
    type State = S;

    fn read<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, StoreError> {
        self.inner.read(f)
    }

    fn write<R, E>(&self, f: impl FnOnce(&mut S) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        self.inner.write_with(f, |state| {
            write_snapshot(&self.path, state).map_err(|e| StoreError::Io(format!("{e:#}")))
        })
    }
}

fn load_snapshot<S: DeserializeOwned>(path: &Path) -> anyhow::Result<S> {
    let file = File::open(path).with_context(|| format!("failed to open snapshot {}", path.display()))?;
    let state = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to decode snapshot {}", path.display()))?;
    Ok(state)
}

fn write_snapshot<S: Serialize>(path: &Path, state: &S) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, state).context("failed to encode snapshot")?;
        writer.flush().context("failed to flush snapshot")?;
        writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move snapshot into place at {}", path.display()))?;
    debug!(path = %path.display(), "snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Notes {
        lines: Vec<String>,
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("jobvault-store-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir.join("state.json")
    }

    #[test]
    fn committed_state_survives_reopen() {
        let path = temp_path("reopen");
        {
            let store: FileStore<Notes> = FileStore::open(&path).unwrap();
            store
                .write(|s| {
                    s.lines.push("first".into());
                    Ok::<_, StoreError>(())
                })
                .unwrap();
        }

        let reopened: FileStore<Notes> = FileStore::open(&path).unwrap();
        let lines = reopened.read(|s| s.lines.clone()).unwrap();
        assert_eq!(lines, vec!["first".to_string()]);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn rolled_back_transaction_is_not_persisted() {
        let path = temp_path("rollback");
        {
            let store: FileStore<Notes> = FileStore::open(&path).unwrap();
            let _ = store.write(|s| {
                s.lines.push("never".into());
                Err::<(), _>(StoreError::Io("no".into()))
            });
        }

        let reopened: FileStore<Notes> = FileStore::open(&path).unwrap();
        assert!(reopened.read(|s| s.lines.is_empty()).unwrap());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn second_owner_is_refused_until_first_closes() {
        let path = temp_path("owner");
        let first: FileStore<Notes> = FileStore::open(&path).unwrap();
        first
            .write(|s| {
                s.lines.push("from-first".into());
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let err = FileStore::<Notes>::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Locked(_)));

        drop(first);
        let second: FileStore<Notes> = FileStore::open(&path).unwrap();
        assert_eq!(second.read(|s| s.lines.clone()).unwrap(), vec!["from-first".to_string()]);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let path = temp_path("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();

        let err = FileStore::<Notes>::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Snapshot(_)));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
