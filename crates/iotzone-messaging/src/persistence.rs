//! JSON snapshots of discovery collections.
//!
//! A snapshot is a JSON object mapping canonical keys to values. Snapshots
//! are written to a temporary file in the target directory and renamed into
//! place, so readers never see a partial file.

use crate::collection::DiscoveryCollection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write every entry of `collection` to `path`.
///
/// # Errors
///
/// Returns error if the entries cannot be serialized or the file cannot be
/// written.
pub fn save_snapshot<T>(path: &Path, collection: &DiscoveryCollection<T>) -> Result<usize, SnapshotError>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let entries = collection.entries_snapshot();
    let snapshot: BTreeMap<&str, &T> = entries
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_ref()))
        .collect();
    let json = serde_json::to_vec_pretty(&snapshot)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&json)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| SnapshotError::Io(e.error))?;

    Ok(snapshot.len())
}

/// Add every entry stored at `path` to `collection`, replacing entries with
/// the same key. A missing file loads nothing.
///
/// # Errors
///
/// Returns error if the file cannot be read or does not hold a snapshot of
/// `T` values.
pub fn load_snapshot<T>(path: &Path, collection: &DiscoveryCollection<T>) -> Result<usize, SnapshotError>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let json = match fs::read(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let snapshot: BTreeMap<String, T> = serde_json::from_slice(&json)?;
    let count = snapshot.len();
    for (key, value) in snapshot {
        collection.add(&key, value);
    }

    Ok(count)
}

/// Snapshot errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Reading or writing the file failed
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot content is not valid
    #[error("snapshot format error: {0}")]
    Format(#[from] serde_json::Error),
}
