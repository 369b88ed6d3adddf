//! In-memory key-value storage with a JSON snapshot on disk.
//!
//! The map lives behind a single `RwLock`: `get` takes the read side, `set`
//! and `delete` take the write side. Nothing here can fail except the
//! snapshot boundary, and only `save` reports its failure to the caller.

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The on-disk form of the store: a flat `{"key": "value"}` object.
///
/// Backed by a `BTreeMap` so files are written in key order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, String>);

impl Snapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<K, V> FromIterator<(K, V)> for Snapshot
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to write snapshot {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode snapshot {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Thread-safe string map shared by every connection.
#[derive(Debug, Default)]
pub struct Store {
    items: RwLock<HashMap<String, String>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the snapshot at `path`, falling back to an empty store.
    ///
    /// A missing file, an unreadable file, or content that is not a flat
    /// string-to-string object all yield an empty store. The failure is
    /// logged and never returned so a bad snapshot cannot block startup.
    pub fn load(path: &Path) -> Self {
        match read_snapshot(path) {
            Ok(Some(snapshot)) => {
                info!(path = %path.display(), records = snapshot.len(), "loaded snapshot");
                Self::from(snapshot)
            }
            Ok(None) => {
                info!(path = %path.display(), "no snapshot found, starting empty");
                Self::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not load snapshot, starting empty");
                Self::new()
            }
        }
    }

    /// Writes every record to `path`, replacing whatever the file held.
    ///
    /// The file is truncated and rewritten in place; a crash during the
    /// write can leave it corrupt.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let snapshot = self.snapshot();
        let io_err = |source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &snapshot).map_err(|source| SnapshotError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        writer.write_all(b"\n").map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        info!(path = %path.display(), records = snapshot.len(), "saved snapshot");
        Ok(())
    }

    /// Inserts `value` under `key`, replacing any previous value.
    pub fn set(&self, key: String, value: String) {
        debug!(%key, "set");
        self.write().insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    /// Removes `key` if present. Deleting a missing key is a no-op.
    pub fn delete(&self, key: &str) {
        debug!(%key, "delete");
        self.write().remove(key);
    }

    /// Copies the current records out from under the lock.
    pub fn snapshot(&self) -> Snapshot {
        self.read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Every critical section is a single map call, so a poisoned lock still
    // guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl From<Snapshot> for Store {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            items: RwLock::new(snapshot.into_inner().into_iter().collect()),
        }
    }
}

fn read_snapshot(path: &Path) -> anyhow::Result<Option<Snapshot>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let snapshot = serde_json::from_reader(BufReader::new(file))?;
    Ok(Some(snapshot))
}
