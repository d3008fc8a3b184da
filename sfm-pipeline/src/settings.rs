use log::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The settings of every pipeline stage.
///
/// Every field has a default so that a settings file only needs to mention what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Retrieval and pair selection
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    /// Descriptor matching and geometric verification
    #[serde(default)]
    pub matcher: MatcherSettings,
    /// In-plane rotation estimation
    #[serde(default)]
    pub rotation: RotationSettings,
    /// Incremental registration
    #[serde(default)]
    pub sfm: SfmSettings,
    /// The maximum number of worker threads
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// The memory available to all workers together in megabytes
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,
    /// The memory one worker is expected to need in megabytes
    #[serde(default = "default_worker_memory_mb")]
    pub worker_memory_mb: u64,
    /// How many times writing an artifact is attempted before giving up
    #[serde(default = "default_persistence_attempts")]
    pub persistence_attempts: usize,
    /// The base seed of every random generator of the pipeline
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retrieval: Default::default(),
            matcher: Default::default(),
            rotation: Default::default(),
            sfm: Default::default(),
            max_workers: default_max_workers(),
            memory_budget_mb: default_memory_budget_mb(),
            worker_memory_mb: default_worker_memory_mb(),
            persistence_attempts: default_persistence_attempts(),
            seed: default_seed(),
        }
    }
}

impl PipelineSettings {
    /// Reads the settings from a JSON file, falling back to the defaults if there is none.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        load_json_or_default(path, "pipeline settings")
    }

    /// The number of workers given the available cores and the memory budget. Always at least one.
    pub fn worker_count(&self, available_cores: usize) -> usize {
        let by_memory = (self.memory_budget_mb / self.worker_memory_mb.max(1)) as usize;
        available_cores.min(self.max_workers).min(by_memory).max(1)
    }
}

fn default_max_workers() -> usize {
    8
}

fn default_memory_budget_mb() -> u64 {
    8 * 1024
}

fn default_worker_memory_mb() -> u64 {
    1024
}

fn default_persistence_attempts() -> usize {
    3
}

fn default_seed() -> u64 {
    0x5EED_0F_5F3D
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Scenes with fewer images than this match every pair. Otherwise this many neighbors
    /// are retrieved for every image.
    #[serde(default = "default_n_retrieval")]
    pub n_retrieval: usize,
    /// The maximum number of pairs any image takes part in
    #[serde(default = "default_max_pairs_per_image")]
    pub max_pairs_per_image: usize,
    /// The side length of the thumbnail used by the `tiny-image` method
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
    /// The number of cells per side used by the `gradient-grid` method
    #[serde(default = "default_grid_cells")]
    pub grid_cells: u32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            n_retrieval: default_n_retrieval(),
            max_pairs_per_image: default_max_pairs_per_image(),
            thumbnail_size: default_thumbnail_size(),
            grid_cells: default_grid_cells(),
        }
    }
}

fn default_n_retrieval() -> usize {
    50
}

fn default_max_pairs_per_image() -> usize {
    20
}

fn default_thumbnail_size() -> u32 {
    16
}

fn default_grid_cells() -> u32 {
    4
}

/// The geometric model used to verify putative matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationModel {
    Fundamental,
    Homography,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherSettings {
    /// A match is kept if its distance is below this fraction of the second best distance
    #[serde(default = "default_ratio")]
    pub ratio: f32,
    /// The inlier threshold of geometric verification in pixels
    #[serde(default = "default_inlier_threshold")]
    pub inlier_threshold: f64,
    /// Pairs with fewer verified correspondences are dropped
    #[serde(default = "default_min_correspondences")]
    pub min_correspondences: usize,
    #[serde(default = "default_verification_model")]
    pub model: VerificationModel,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            ratio: default_ratio(),
            inlier_threshold: default_inlier_threshold(),
            min_correspondences: default_min_correspondences(),
            model: default_verification_model(),
        }
    }
}

fn default_ratio() -> f32 {
    0.8
}

fn default_inlier_threshold() -> f64 {
    3.0
}

fn default_min_correspondences() -> usize {
    15
}

fn default_verification_model() -> VerificationModel {
    VerificationModel::Fundamental
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationSettings {
    /// The fraction of the image side covered by each border band
    #[serde(default = "default_border_fraction")]
    pub border_fraction: f32,
    /// The brightest band must beat the second brightest by this much, in `[0, 1]` intensity
    #[serde(default = "default_min_contrast")]
    pub min_contrast: f32,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            border_fraction: default_border_fraction(),
            min_contrast: default_min_contrast(),
        }
    }
}

fn default_border_fraction() -> f32 {
    0.2
}

fn default_min_contrast() -> f32 {
    0.08
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SfmSettings {
    /// The minimum number of essential matrix inliers of the seed pair
    #[serde(default = "default_seed_min_inliers")]
    pub seed_min_inliers: usize,
    /// The minimum median triangulation angle of the seed pair in degrees
    #[serde(default = "default_seed_min_angle_degrees")]
    pub seed_min_angle_degrees: f64,
    /// The number of candidate seed pairs tried before giving up
    #[serde(default = "default_seed_candidates")]
    pub seed_candidates: usize,
    /// The reprojection threshold of pose estimation in pixels
    #[serde(default = "default_pnp_threshold")]
    pub pnp_threshold: f64,
    /// The minimum number of 2d-3d inliers needed to register an image
    #[serde(default = "default_pnp_min_inliers")]
    pub pnp_min_inliers: usize,
    /// Observations with a larger reprojection error in pixels are removed
    #[serde(default = "default_max_reprojection_error")]
    pub max_reprojection_error: f64,
    /// Points are only triangulated if two rays meet at this angle in degrees
    #[serde(default = "default_min_triangulation_angle_degrees")]
    pub min_triangulation_angle_degrees: f64,
    /// Bundle adjustment runs after this many registrations
    #[serde(default = "default_ba_interval")]
    pub ba_interval: usize,
    /// The number of alternation rounds of one bundle adjustment
    #[serde(default = "default_ba_rounds")]
    pub ba_rounds: usize,
    /// The residual in pixels above which the loss becomes linear
    #[serde(default = "default_loss_cutoff")]
    pub loss_cutoff: f64,
    /// The reprojection threshold of the localization pass in pixels
    #[serde(default = "default_localization_threshold")]
    pub localization_threshold: f64,
    /// The minimum number of inliers of the localization pass
    #[serde(default = "default_localization_min_inliers")]
    pub localization_min_inliers: usize,
}

impl Default for SfmSettings {
    fn default() -> Self {
        Self {
            seed_min_inliers: default_seed_min_inliers(),
            seed_min_angle_degrees: default_seed_min_angle_degrees(),
            seed_candidates: default_seed_candidates(),
            pnp_threshold: default_pnp_threshold(),
            pnp_min_inliers: default_pnp_min_inliers(),
            max_reprojection_error: default_max_reprojection_error(),
            min_triangulation_angle_degrees: default_min_triangulation_angle_degrees(),
            ba_interval: default_ba_interval(),
            ba_rounds: default_ba_rounds(),
            loss_cutoff: default_loss_cutoff(),
            localization_threshold: default_localization_threshold(),
            localization_min_inliers: default_localization_min_inliers(),
        }
    }
}

fn default_seed_min_inliers() -> usize {
    30
}

fn default_seed_min_angle_degrees() -> f64 {
    1.5
}

fn default_seed_candidates() -> usize {
    10
}

fn default_pnp_threshold() -> f64 {
    4.0
}

fn default_pnp_min_inliers() -> usize {
    12
}

fn default_max_reprojection_error() -> f64 {
    4.0
}

fn default_min_triangulation_angle_degrees() -> f64 {
    1.0
}

fn default_ba_interval() -> usize {
    3
}

fn default_ba_rounds() -> usize {
    3
}

fn default_loss_cutoff() -> f64 {
    2.0
}

fn default_localization_threshold() -> f64 {
    8.0
}

fn default_localization_min_inliers() -> usize {
    8
}

/// How thoroughly the refinement stage optimizes a reconstruction when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementMode {
    Full,
    Reduced,
}

/// The refinement configuration, read from its own file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementSettings {
    /// The requested mode. `full` is downgraded to `reduced` when over the memory budget.
    #[serde(default = "default_refinement_mode")]
    pub mode: RefinementMode,
    /// Bundle adjustment rounds of the full mode
    #[serde(default = "default_full_rounds")]
    pub full_rounds: usize,
    /// Bundle adjustment rounds of the reduced mode
    #[serde(default = "default_reduced_rounds")]
    pub reduced_rounds: usize,
    /// Solver iterations per camera or point
    #[serde(default = "default_refinement_iterations")]
    pub iterations: usize,
    /// The reduced mode only optimizes this many of the longest tracks
    #[serde(default = "default_reduced_track_cap")]
    pub reduced_track_cap: usize,
    /// The memory the full mode may use in megabytes
    #[serde(default = "default_refinement_memory_budget_mb")]
    pub memory_budget_mb: u64,
    /// The estimated working set of one observation in bytes
    #[serde(default = "default_bytes_per_observation")]
    pub bytes_per_observation: u64,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            mode: default_refinement_mode(),
            full_rounds: default_full_rounds(),
            reduced_rounds: default_reduced_rounds(),
            iterations: default_refinement_iterations(),
            reduced_track_cap: default_reduced_track_cap(),
            memory_budget_mb: default_refinement_memory_budget_mb(),
            bytes_per_observation: default_bytes_per_observation(),
        }
    }
}

impl RefinementSettings {
    /// Reads the refinement configuration, falling back to the defaults if there is none.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        load_json_or_default(path, "refinement settings")
    }
}

fn default_refinement_mode() -> RefinementMode {
    RefinementMode::Full
}

fn default_full_rounds() -> usize {
    10
}

fn default_reduced_rounds() -> usize {
    3
}

fn default_refinement_iterations() -> usize {
    20
}

fn default_reduced_track_cap() -> usize {
    5000
}

fn default_refinement_memory_budget_mb() -> u64 {
    4096
}

fn default_bytes_per_observation() -> u64 {
    512
}

fn load_json_or_default<T>(path: Option<&Path>, what: &str) -> T
where
    T: Default + serde::de::DeserializeOwned,
{
    let loaded = path
        .and_then(|path| std::fs::File::open(path).ok())
        .and_then(|file| match serde_json::from_reader(std::io::BufReader::new(file)) {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!("ignoring malformed {}: {}", what, e);
                None
            }
        });
    if loaded.is_some() {
        info!("loaded existing {}", what);
    } else {
        info!("used default {}", what);
    }
    loaded.unwrap_or_default()
}
