//! Local feature extraction.
//!
//! A [`FeatureBackend`] turns one grayscale image into a [`KeypointSet`]. Backends are looked up
//! by name in a [`BackendRegistry`] once, when the run starts, and never depend on each other.

mod dog;
mod fast_brief;
mod harris;
pub mod image;
mod store;

pub use dog::DogBlobs;
pub use fast_brief::FastBrief;
pub use harris::HarrisPatches;
pub use store::{FeatureKey, FeatureStore};

use crate::{ExtractionError, PipelineError};
use ::image::GrayImage;
use sfm_core::{BackendId, ImageId, KeypointSet};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Extracts keypoints and descriptors from an image.
///
/// The output must only depend on the pixels and the configuration, which is summarized by
/// [`FeatureBackend::config_hash`]. Cached keypoints are reused whenever the name and hash
/// match, so changing the configuration without changing the hash serves stale keypoints.
pub trait FeatureBackend: Send + Sync {
    /// The name the backend is selected by.
    fn name(&self) -> &str;

    /// A stable hash of every parameter that influences the output.
    fn config_hash(&self) -> u64;

    /// Extracts the keypoints of `pixels`, which belong to `image`.
    ///
    /// Keypoints are ordered deterministically, usually by decreasing response.
    fn extract(&self, image: ImageId, pixels: &GrayImage) -> Result<KeypointSet, ExtractionError>;
}

/// Maps backend names to backend instances.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn FeatureBackend>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// A registry containing every built-in backend with its default configuration.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HarrisPatches::default()));
        registry.register(Arc::new(FastBrief::default()));
        registry.register(Arc::new(DogBlobs::default()));
        registry
    }

    /// Adds a backend, replacing any backend of the same name.
    pub fn register(&mut self, backend: Arc<dyn FeatureBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.backends.keys().map(String::as_str)
    }

    /// Resolves the configured backend names in order. The position of a backend in the
    /// returned list is its [`BackendId`](sfm_core::BackendId).
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn FeatureBackend>>, PipelineError> {
        if names.is_empty() {
            return Err(PipelineError::Config(
                "at least one feature backend is required".to_string(),
            ));
        }
        if names.len() > usize::from(u8::MAX) {
            return Err(PipelineError::Config(format!(
                "{} feature backends configured but at most {} are supported",
                names.len(),
                u8::MAX
            )));
        }
        for (ix, name) in names.iter().enumerate() {
            if names[..ix].contains(name) {
                return Err(PipelineError::Config(format!(
                    "feature backend {:?} is configured twice",
                    name
                )));
            }
        }
        names
            .iter()
            .map(|name| {
                self.backends
                    .get(name)
                    .cloned()
                    .ok_or_else(|| PipelineError::UnknownBackend(name.clone()))
            })
            .collect()
    }
}

/// The keypoints of every image of a scene for every configured backend.
///
/// Images a backend failed on have no entry for that backend.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct SceneFeatures {
    /// Indexed by backend, then image.
    sets: Vec<Vec<Option<KeypointSet>>>,
}

impl SceneFeatures {
    pub fn new(backends: usize, images: usize) -> Self {
        Self {
            sets: vec![vec![None; images]; backends],
        }
    }

    pub fn backends(&self) -> usize {
        self.sets.len()
    }

    pub fn images(&self) -> usize {
        self.sets.first().map_or(0, Vec::len)
    }

    pub fn get(&self, backend: BackendId, image: ImageId) -> Option<&KeypointSet> {
        self.sets
            .get(backend.index())
            .and_then(|sets| sets.get(image.index()))
            .and_then(Option::as_ref)
    }

    pub fn insert(&mut self, backend: BackendId, set: KeypointSet) {
        let image = set.image.index();
        if let Some(slot) = self
            .sets
            .get_mut(backend.index())
            .and_then(|sets| sets.get_mut(image))
        {
            *slot = Some(set);
        }
    }

    /// The number of keypoints of an image for a backend, zero when extraction failed.
    pub fn count(&self, backend: BackendId, image: ImageId) -> usize {
        self.get(backend, image).map_or(0, KeypointSet::len)
    }
}

/// Reads and decodes an image into 8 bit grayscale.
pub fn load_gray(path: &Path) -> Result<GrayImage, ExtractionError> {
    let bytes = std::fs::read(path).map_err(|source| ExtractionError::ImageRead {
        path: path.to_path_buf(),
        source,
    })?;
    let decoded = ::image::load_from_memory(&bytes).map_err(|source| ExtractionError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decoded.into_luma8())
}

/// Mixes a parameter into a running configuration hash.
pub(crate) fn hash_parameter(hash: u64, name: &str, value: impl ToString) -> u64 {
    let text = format!("{}={};", name, value.to_string());
    crate::persist::stable_hash(text.as_bytes()) ^ hash.rotate_left(17)
}

/// Returns an error if the image is smaller than `minimum` pixels on any side.
pub(crate) fn require_size(
    backend: &str,
    pixels: &GrayImage,
    minimum: u32,
) -> Result<(), ExtractionError> {
    if pixels.width() < minimum || pixels.height() < minimum {
        Err(ExtractionError::ImageTooSmall {
            backend: backend.to_string(),
            width: pixels.width(),
            height: pixels.height(),
        })
    } else {
        Ok(())
    }
}
