use crate::RefinementOutcome;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A feature backend could not produce keypoints for one image.
///
/// This never stops the pipeline. The image simply has no keypoints for that backend.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unable to read image {path}: {source}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to decode image {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image of {width} x {height} pixels is too small for backend {backend}")]
    ImageTooSmall {
        backend: String,
        width: u32,
        height: u32,
    },
}

/// An error that stops the processing of one scene. Other scenes are not affected.
#[derive(Debug, Error)]
pub enum SceneError {
    #[error("scene has {usable} usable images but at least two are needed to rank pairs")]
    RetrievalEmptyResult { usable: usize },
    #[error("no image of the scene could be registered")]
    NoRegisteredImages,
    #[error("unable to persist {path} after {attempts} attempts: {source}")]
    Persistence {
        path: PathBuf,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("scene processing was cancelled")]
    Cancelled,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("binary serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An error that stops the whole run before any scene is processed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown feature backend {0:?}")]
    UnknownBackend(String),
    #[error("unknown retrieval method {0:?}")]
    UnknownRetrieval(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unable to read data directory {path}: {source}")]
    DataRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("unable to write run summary: {0}")]
    Summary(#[source] SceneError),
}

/// A problem that was absorbed while processing a scene and is listed in its summary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SceneWarning {
    #[error("image {image} has no keypoints from backend {backend}: {reason}")]
    ImageDecode {
        image: String,
        backend: String,
        reason: String,
    },
    #[error("image {image} has no candidate pair and will likely stay unregistered")]
    PairSelectionIsolatedImage { image: String },
    #[error("pair {image_a} / {image_b} dropped for backend {backend} with {verified} of {required} required correspondences")]
    MatchInsufficientCorrespondences {
        image_a: String,
        image_b: String,
        backend: String,
        verified: usize,
        required: usize,
    },
    #[error("image {image} could not be registered: {reason}")]
    RegistrationFailure { image: String, reason: String },
    #[error("refinement {outcome:?} for {images} images (threshold {threshold}) with an estimated {estimated_mb} MB (budget {budget_mb} MB)")]
    RefinementBudgetExceeded {
        images: usize,
        threshold: usize,
        estimated_mb: u64,
        budget_mb: u64,
        outcome: RefinementOutcome,
    },
}
