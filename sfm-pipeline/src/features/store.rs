use crate::persist::{read_bincode, write_bincode};
use crate::{ExtractionError, SceneError};
use log::*;
use sfm_core::{ImageId, KeypointSet, QuarterTurn};
use std::path::{Path, PathBuf};

/// Identifies the keypoints of one image as produced by one backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureKey {
    pub image_name: String,
    pub backend: String,
    pub config_hash: u64,
    /// The rotation applied to the image before extraction.
    pub turn: QuarterTurn,
}

/// A content addressed store of keypoint sets on disk.
///
/// Keypoints live at `<root>/<backend>/<config hash>/<image name>.r<degrees>.bin`, so two
/// configurations of a backend never share entries and a run can reuse the keypoints of any
/// earlier run with the same configuration.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    root: PathBuf,
    attempts: usize,
}

impl FeatureStore {
    pub fn new(root: impl Into<PathBuf>, attempts: usize) -> Self {
        Self {
            root: root.into(),
            attempts,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &FeatureKey) -> PathBuf {
        self.root
            .join(&key.backend)
            .join(format!("{:016x}", key.config_hash))
            .join(format!("{}.r{}.bin", key.image_name, key.turn.degrees()))
    }

    /// Returns the stored keypoints, if any. Unreadable entries count as missing.
    pub fn get(&self, key: &FeatureKey, image: ImageId) -> Option<KeypointSet> {
        let path = self.path(key);
        if !path.exists() {
            return None;
        }
        match read_bincode::<KeypointSet>(&path) {
            Ok(mut set) => {
                // Ids are assigned per run, so the stored one may be stale.
                set.image = image;
                Some(set)
            }
            Err(e) => {
                warn!("ignoring unreadable keypoints {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn put(&self, key: &FeatureKey, set: &KeypointSet) -> Result<(), SceneError> {
        write_bincode(&self.path(key), set, self.attempts)
    }

    /// Returns the stored keypoints or computes and stores them.
    ///
    /// With `overwrite` the stored keypoints are ignored. The outer error is fatal for the
    /// scene, the inner one only concerns this image and backend and is never stored.
    pub fn get_or_compute(
        &self,
        key: &FeatureKey,
        image: ImageId,
        overwrite: bool,
        compute: impl FnOnce() -> Result<KeypointSet, ExtractionError>,
    ) -> Result<Result<KeypointSet, ExtractionError>, SceneError> {
        if !overwrite {
            if let Some(set) = self.get(key, image) {
                return Ok(Ok(set));
            }
        }
        match compute() {
            Ok(set) => {
                self.put(key, &set)?;
                Ok(Ok(set))
            }
            Err(e) => Ok(Err(e)),
        }
    }
}
