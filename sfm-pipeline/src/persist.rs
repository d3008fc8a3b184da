//! Durable storage of stage artifacts.
//!
//! Every artifact is written to a hidden sibling file first and then renamed over the final
//! path, so a reader never sees a partially written artifact even if the process dies.

use crate::SceneError;
use log::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Writes `bytes` to `path` atomically, attempting up to `attempts` times.
pub fn write_atomic(path: &Path, bytes: &[u8], attempts: usize) -> Result<(), SceneError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_write_atomic(path, bytes) {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= attempts => {
                return Err(SceneError::Persistence {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                warn!(
                    "attempt {} of {} to write {} failed: {}",
                    attempt,
                    attempts,
                    path.display(),
                    e
                );
                std::thread::sleep(Duration::from_millis(25 * attempt as u64));
            }
        }
    }
}

fn try_write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temporary = temporary_path(path);
    let result = (|| {
        let mut file = fs::File::create(&temporary)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temporary, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temporary);
    }
    result
}

fn temporary_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

pub fn write_bincode<T: Serialize>(path: &Path, value: &T, attempts: usize) -> Result<(), SceneError> {
    let bytes = bincode::serialize(value)?;
    write_atomic(path, &bytes, attempts)
}

pub fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T, SceneError> {
    let file = fs::File::open(path)?;
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T, attempts: usize) -> Result<(), SceneError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes, attempts)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, SceneError> {
    let file = fs::File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// An artifact together with the fingerprint of the inputs and settings it was made from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageArtifact<T> {
    pub fingerprint: u64,
    pub value: T,
}

/// Loads a stage artifact if it exists and was produced from the same inputs.
///
/// Unreadable or stale artifacts are treated as missing.
pub fn load_stage<T: DeserializeOwned>(path: &Path, fingerprint: u64) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match read_bincode::<StageArtifact<T>>(path) {
        Ok(artifact) if artifact.fingerprint == fingerprint => Some(artifact.value),
        Ok(_) => {
            debug!("{} is stale", path.display());
            None
        }
        Err(e) => {
            warn!("ignoring unreadable artifact {}: {}", path.display(), e);
            None
        }
    }
}

pub fn store_stage<T: Serialize>(
    path: &Path,
    fingerprint: u64,
    value: &T,
    attempts: usize,
) -> Result<(), SceneError> {
    write_bincode(path, &BorrowedArtifact { fingerprint, value }, attempts)
}

/// Like [`load_stage`] for artifacts kept as JSON so they can be inspected by hand.
pub fn load_json_stage<T: DeserializeOwned>(path: &Path, fingerprint: u64) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match read_json::<StageArtifact<T>>(path) {
        Ok(artifact) if artifact.fingerprint == fingerprint => Some(artifact.value),
        Ok(_) => {
            debug!("{} is stale", path.display());
            None
        }
        Err(e) => {
            warn!("ignoring unreadable artifact {}: {}", path.display(), e);
            None
        }
    }
}

pub fn store_json_stage<T: Serialize>(
    path: &Path,
    fingerprint: u64,
    value: &T,
    attempts: usize,
) -> Result<(), SceneError> {
    write_json(path, &BorrowedArtifact { fingerprint, value }, attempts)
}

#[derive(Serialize)]
struct BorrowedArtifact<'a, T> {
    fingerprint: u64,
    value: &'a T,
}

/// 64 bit FNV-1a. Stable across runs, platforms and compiler versions, unlike `std` hashers.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

/// Fingerprint of any serializable value through its JSON form.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> u64 {
    serde_json::to_vec(value)
        .map(|bytes| stable_hash(&bytes))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_reference_values() {
        assert_eq!(stable_hash(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(stable_hash(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn stale_artifacts_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.bin");
        store_stage(&path, 7, &vec![1u32, 2, 3], 1).unwrap();
        assert_eq!(load_stage::<Vec<u32>>(&path, 7), Some(vec![1, 2, 3]));
        assert_eq!(load_stage::<Vec<u32>>(&path, 8), None);
        assert!(!temporary_path(&path).exists());
    }

    #[test]
    fn persistence_error_after_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("artifact.json");
        match write_json(&path, &1u8, 2) {
            Err(SceneError::Persistence { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
