//! # SfM Pipeline
//!
//! Recovers camera poses and a sparse point cloud from unordered photographs of a scene.
//!
//! For every scene the [`Orchestrator`] runs these stages, persisting the result of each:
//!
//! 1. Retrieval embeddings of every image ([`RetrievalIndex`]) and the pair graph built from
//!    their ranking ([`pairs::select`]).
//! 2. Optional quarter turn estimation of every image ([`RotationNormalizer`]).
//! 3. Keypoint extraction by every configured [`FeatureBackend`], cached in a [`FeatureStore`].
//! 4. Mutual nearest neighbor matching with geometric verification ([`Matcher`]).
//! 5. Fusion of the correspondences of every backend into tracks ([`fusion::fuse`]).
//! 6. Incremental registration ([`SfmEngine`]) followed by memory gated refinement
//!    ([`refine`]) and an optional localization pass.
//!
//! Failures that concern one image, pair or backend are recorded as [`SceneWarning`]s. A
//! [`SceneError`] stops only its scene and a [`PipelineError`] stops the run before any scene.

pub mod dataset;
pub mod engine;
mod error;
pub mod export;
pub mod features;
pub mod fusion;
pub mod matching;
pub mod orchestrator;
pub mod pairs;
pub mod persist;
pub mod refine;
pub mod retrieval;
pub mod rotation;
mod settings;

pub use dataset::{Mode, SceneSource};
pub use engine::{RegistrationError, SceneGraph, SfmEngine};
pub use error::*;
pub use features::{BackendRegistry, FeatureBackend, FeatureKey, FeatureStore, SceneFeatures};
pub use fusion::{FusionResult, KeypointLayout};
pub use matching::{MatchReport, Matcher};
pub use orchestrator::{
    CancellationToken, Orchestrator, RunConfig, RunSummary, SceneReport, SceneStatus, StageTimings,
    UnregisteredImage,
};
pub use pairs::PairSelection;
pub use refine::{RefinementOutcome, RefinementPlan};
pub use retrieval::{Ranking, RetrievalIndex, RetrievalMethod};
pub use rotation::RotationNormalizer;
pub use settings::*;
