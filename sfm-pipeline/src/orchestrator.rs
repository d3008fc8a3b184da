//! Runs every stage of the pipeline for every scene of a data directory.
//!
//! Each scene is processed independently in its own output directory:
//!
//! ```text
//! <output>/<dataset>/<scene>/
//!     features/          keypoints of every backend, see FeatureStore
//!     preprocess.bin     retrieval embeddings
//!     rotation.bin       quarter turns, only with rotation matching
//!     pairs.json         the selected pairs
//!     matches.bin        verified correspondences
//!     tracks.bin         the fused tracks
//!     sfm.bin            the reconstruction before refinement
//!     refined-<hash>.bin the refined reconstruction per refinement configuration
//!     reconstruction.bin the final reconstruction
//!     points.ply         the final reconstruction for viewing
//!     summary.json       written last, marks the scene complete
//! ```
//!
//! Every stage artifact records a fingerprint of its inputs and is reused on the next run while
//! the fingerprint matches, unless overwriting is requested.

use crate::dataset::{self, Mode, SceneSource};
use crate::engine::{registration_warnings, SceneGraph, SfmEngine};
use crate::features::{load_gray, BackendRegistry, FeatureBackend, FeatureKey, FeatureStore, SceneFeatures};
use crate::fusion::{fuse, FusionResult, KeypointLayout};
use crate::matching::{MatchReport, Matcher};
use crate::pairs::{self, PairSelection};
use crate::persist::{self, fingerprint};
use crate::refine::{self, RefinementOutcome};
use crate::retrieval::{RetrievalIndex, RetrievalMethod};
use crate::rotation::RotationNormalizer;
use crate::{PipelineError, PipelineSettings, RefinementSettings, SceneError, SceneWarning};
use log::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sfm_core::{BackendId, ImageId, ImageInfo, QuarterTurn, Reconstruction};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Everything a run is configured with.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mode: Mode,
    /// Feature backend names. The position of a name is its backend id.
    pub backends: Vec<String>,
    pub retrieval: RetrievalMethod,
    pub rotation_matching: bool,
    pub shared_camera: bool,
    pub localize_unregistered: bool,
    pub refinement_config: Option<PathBuf>,
    /// Scenes with more images are not refined.
    pub refinement_memory_threshold: usize,
    /// Recompute the refined reconstruction even if one is cached.
    pub force_refinement: bool,
    /// Recompute every stage of every scene.
    pub overwrite: bool,
    /// Scene names or `<dataset>/<scene>` keys that are not processed.
    pub skip_scenes: Vec<String>,
    pub settings: PipelineSettings,
}

impl RunConfig {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
            mode: Mode::Train,
            backends: vec!["harris".to_string()],
            retrieval: RetrievalMethod::TinyImage,
            rotation_matching: false,
            shared_camera: false,
            localize_unregistered: false,
            refinement_config: None,
            refinement_memory_threshold: 500,
            force_refinement: false,
            overwrite: false,
            skip_scenes: vec![],
            settings: Default::default(),
        }
    }
}

/// Requests the cancellation of a run. Scenes stop at the next stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SceneError> {
        if self.is_cancelled() {
            Err(SceneError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Complete,
    Failed,
}

/// Wall clock seconds spent in every stage of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub preprocessing: f64,
    pub pairs: f64,
    pub rotation: f64,
    pub extraction: f64,
    pub matching: f64,
    pub ensemble: f64,
    pub sfm: f64,
    pub refinement: f64,
    pub localization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisteredImage {
    pub image: String,
    pub reason: String,
}

/// The outcome of one scene as written to its `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneReport {
    pub scene: String,
    pub status: SceneStatus,
    pub images: usize,
    pub registered: usize,
    pub unregistered: Vec<UnregisteredImage>,
    pub pairs: usize,
    /// Pairs without verified correspondences for any backend.
    pub dropped_pairs: Vec<(String, String)>,
    pub tracks: usize,
    pub points: usize,
    pub mean_reprojection_error: f64,
    /// `None` if the scene failed before refinement.
    pub refinement: Option<RefinementOutcome>,
    pub timings: StageTimings,
    pub warnings: Vec<SceneWarning>,
    pub error: Option<String>,
}

impl SceneReport {
    fn new(scene: String) -> Self {
        Self {
            scene,
            status: SceneStatus::Failed,
            images: 0,
            registered: 0,
            unregistered: vec![],
            pairs: 0,
            dropped_pairs: vec![],
            tracks: 0,
            points: 0,
            mean_reprojection_error: 0.0,
            refinement: None,
            timings: Default::default(),
            warnings: vec![],
            error: None,
        }
    }

    fn warn(&mut self, warning: SceneWarning) {
        warn!("{}: {}", self.scene, warning);
        self.warnings.push(warning);
    }
}

/// The outcome of a run, written to `summary.json` at the root of the output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub mode: Mode,
    /// Sorted by scene key. Skipped scenes are absent.
    pub scenes: Vec<SceneReport>,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &SceneReport> + '_ {
        self.scenes
            .iter()
            .filter(|scene| scene.status == SceneStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Runs the pipeline over a data directory.
pub struct Orchestrator {
    config: RunConfig,
    backends: Vec<Arc<dyn FeatureBackend>>,
    refinement: RefinementSettings,
    retrieval: RetrievalIndex,
    normalizer: RotationNormalizer,
    pool: rayon::ThreadPool,
    cancellation: CancellationToken,
}

impl Orchestrator {
    /// Resolves the backends and builds the worker pool.
    pub fn new(config: RunConfig, registry: &BackendRegistry) -> Result<Self, PipelineError> {
        let backends = registry.resolve(&config.backends)?;
        let refinement = RefinementSettings::load_or_default(config.refinement_config.as_deref());
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let workers = config.settings.worker_count(cores);
        info!("using {} workers", workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?;
        Ok(Self {
            retrieval: RetrievalIndex::new(config.retrieval, config.settings.retrieval.clone()),
            normalizer: RotationNormalizer::new(
                config.rotation_matching,
                config.settings.rotation.clone(),
            ),
            config,
            backends,
            refinement,
            pool,
            cancellation: Default::default(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Processes every scene that is not skip-listed.
    ///
    /// A failing scene is recorded in the summary and does not stop the others.
    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let scenes = dataset::discover_scenes(&self.config.data_dir, self.config.mode)?;
        let mut reports = vec![];
        let mut submission = vec![dataset::SUBMISSION_HEADER.to_string()];
        for source in scenes {
            if self
                .config
                .skip_scenes
                .iter()
                .any(|entry| source.matches(entry))
            {
                info!("skipping scene {}", source.key());
                continue;
            }
            let report = self.process_scene(&source);
            if self.config.mode == Mode::Eval && report.status == SceneStatus::Complete {
                let path = self.scene_dir(&source).join("reconstruction.bin");
                match persist::read_bincode::<Reconstruction>(&path) {
                    Ok(reconstruction) => {
                        submission.extend(dataset::submission_rows(&source, &reconstruction))
                    }
                    Err(e) => error!("unable to read {}: {}", path.display(), e),
                }
            }
            reports.push(report);
        }

        let summary = RunSummary {
            mode: self.config.mode,
            scenes: reports,
        };
        let attempts = self.config.settings.persistence_attempts;
        persist::write_json(&self.config.output_dir.join("summary.json"), &summary, attempts)
            .map_err(PipelineError::Summary)?;
        if self.config.mode == Mode::Eval {
            let mut csv = submission.join("\n");
            csv.push('\n');
            persist::write_atomic(
                &self.config.output_dir.join("submission.csv"),
                csv.as_bytes(),
                attempts,
            )
            .map_err(PipelineError::Summary)?;
        }
        for failed in summary.failed() {
            error!(
                "scene {} failed: {}",
                failed.scene,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }
        info!(
            "processed {} scenes, {} failed",
            summary.scenes.len(),
            summary.failed().count()
        );
        Ok(summary)
    }

    pub fn scene_dir(&self, source: &SceneSource) -> PathBuf {
        source.output_dir(&self.config.output_dir)
    }

    /// Runs a scene and turns a fatal error into a failed report.
    fn process_scene(&self, source: &SceneSource) -> SceneReport {
        let mut report = SceneReport::new(source.key());
        info!("processing scene {}", report.scene);
        match self.run_scene(source, &mut report) {
            Ok(()) => report,
            Err(e) => {
                error!("scene {} failed: {}", report.scene, e);
                report.status = SceneStatus::Failed;
                report.error = Some(e.to_string());
                if !matches!(e, SceneError::Persistence { .. }) {
                    let path = self.scene_dir(source).join("summary.json");
                    if let Err(e) =
                        persist::write_json(&path, &report, self.config.settings.persistence_attempts)
                    {
                        error!("unable to record failure of {}: {}", report.scene, e);
                    }
                }
                report
            }
        }
    }

    /// Runs every stage of one scene, filling `report` as it goes.
    pub fn run_scene(&self, source: &SceneSource, report: &mut SceneReport) -> Result<(), SceneError> {
        let scene_dir = self.scene_dir(source);
        let summary_path = scene_dir.join("summary.json");
        let attempts = self.config.settings.persistence_attempts;
        let overwrite = self.config.overwrite;
        // Complete scenes are reused unless the run forces their refinement.
        if !overwrite && !self.config.force_refinement && summary_path.exists() {
            match persist::read_json::<SceneReport>(&summary_path) {
                Ok(previous) if previous.status == SceneStatus::Complete => {
                    info!("scene {} is already complete", report.scene);
                    *report = previous;
                    return Ok(());
                }
                Ok(_) => info!("retrying scene {}", report.scene),
                Err(e) => warn!("ignoring unreadable {}: {}", summary_path.display(), e),
            }
        }
        let cancellation = &self.cancellation;
        let settings = &self.config.settings;

        // Preprocessing: image information and retrieval embeddings.
        let start = Instant::now();
        let images = dataset::load_images(source, self.config.shared_camera)?;
        report.images = images.len();
        let images_fingerprint = fingerprint(&images);
        let embeddings_fingerprint = fingerprint(&(
            "embeddings",
            images_fingerprint,
            self.retrieval.method.name(),
            &self.retrieval.settings,
        ));
        let embeddings_path = scene_dir.join("preprocess.bin");
        let embeddings: Vec<Option<Vec<f32>>> =
            match stage(overwrite, &embeddings_path, embeddings_fingerprint) {
                Some(embeddings) => embeddings,
                None => {
                    let embeddings: Vec<Option<Vec<f32>>> = self.pool.install(|| {
                        images
                            .par_iter()
                            .map(|info| {
                                load_gray(&source.image_dir.join(&info.name))
                                    .ok()
                                    .map(|pixels| self.retrieval.embed(&pixels))
                            })
                            .collect()
                    });
                    persist::store_stage(&embeddings_path, embeddings_fingerprint, &embeddings, attempts)?;
                    embeddings
                }
            };
        report.timings.preprocessing = finish_stage(&report.scene, "preprocessing", start);
        cancellation.check()?;

        // Pairs
        let start = Instant::now();
        let all_images: Vec<ImageId> = images.iter().map(|info| info.id).collect();
        let embedded: Vec<(ImageId, Vec<f32>)> = all_images
            .iter()
            .zip(embeddings)
            .filter_map(|(&image, embedding)| embedding.map(|embedding| (image, embedding)))
            .collect();
        if embedded.len() < 2 {
            return Err(SceneError::RetrievalEmptyResult {
                usable: embedded.len(),
            });
        }
        let pairs_fingerprint = fingerprint(&(
            "pairs",
            embeddings_fingerprint,
            settings.retrieval.n_retrieval,
            settings.retrieval.max_pairs_per_image,
        ));
        let pairs_path = scene_dir.join("pairs.json");
        let selection: PairSelection = match (!overwrite)
            .then(|| persist::load_json_stage(&pairs_path, pairs_fingerprint))
            .flatten()
        {
            Some(selection) => selection,
            None => {
                let selection = if embedded.len() < settings.retrieval.n_retrieval {
                    info!(
                        "matching all pairs of {} images of scene {}",
                        embedded.len(),
                        report.scene
                    );
                    let usable: Vec<ImageId> = embedded.iter().map(|(image, _)| *image).collect();
                    pairs::exhaustive(&usable, &all_images)
                } else {
                    let rankings = self
                        .pool
                        .install(|| self.retrieval.rank_all(&embedded, settings.retrieval.n_retrieval));
                    pairs::select(&rankings, settings.retrieval.max_pairs_per_image, &all_images)
                };
                persist::store_json_stage(&pairs_path, pairs_fingerprint, &selection, attempts)?;
                selection
            }
        };
        drop(embedded);
        report.pairs = selection.pairs.len();
        for &image in &selection.isolated {
            report.warn(SceneWarning::PairSelectionIsolatedImage {
                image: image_name(&images, image),
            });
        }
        report.timings.pairs = finish_stage(&report.scene, "pairs", start);
        cancellation.check()?;

        // Rotation
        let start = Instant::now();
        let turns: Vec<QuarterTurn> = if self.normalizer.enabled {
            let rotation_fingerprint =
                fingerprint(&("rotation", images_fingerprint, &self.normalizer.settings));
            let rotation_path = scene_dir.join("rotation.bin");
            match stage(overwrite, &rotation_path, rotation_fingerprint) {
                Some(turns) => turns,
                None => {
                    let turns: Vec<QuarterTurn> = self.pool.install(|| {
                        images
                            .par_iter()
                            .map(|info| {
                                load_gray(&source.image_dir.join(&info.name))
                                    .map_or(QuarterTurn::R0, |pixels| {
                                        self.normalizer.estimate_rotation(&pixels)
                                    })
                            })
                            .collect()
                    });
                    persist::store_stage(&rotation_path, rotation_fingerprint, &turns, attempts)?;
                    turns
                }
            }
        } else {
            vec![QuarterTurn::R0; images.len()]
        };
        let rotated = turns.iter().filter(|&&turn| turn != QuarterTurn::R0).count();
        if rotated > 0 {
            info!("{} images of scene {} are rotated", rotated, report.scene);
        }
        report.timings.rotation = finish_stage(&report.scene, "rotation", start);
        cancellation.check()?;

        // Extraction
        let start = Instant::now();
        let store = FeatureStore::new(scene_dir.join("features"), attempts);
        let mut features = SceneFeatures::new(self.backends.len(), images.len());
        for (ix, backend) in self.backends.iter().enumerate() {
            let backend_id = BackendId(ix as u8);
            let results: Vec<_> = self.pool.install(|| {
                images
                    .par_iter()
                    .zip(turns.par_iter())
                    .map(|(info, &turn)| {
                        let key = FeatureKey {
                            image_name: info.name.clone(),
                            backend: backend.name().to_string(),
                            config_hash: backend.config_hash(),
                            turn,
                        };
                        store.get_or_compute(&key, info.id, overwrite, || {
                            let pixels = load_gray(&source.image_dir.join(&info.name))?;
                            self.normalizer
                                .extract(backend.as_ref(), info.id, &pixels, turn)
                        })
                    })
                    .collect()
            });
            for (info, result) in images.iter().zip(results) {
                match result? {
                    Ok(set) => features.insert(backend_id, set),
                    Err(e) => report.warn(SceneWarning::ImageDecode {
                        image: info.name.clone(),
                        backend: backend.name().to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
        }
        report.timings.extraction = finish_stage(&report.scene, "extraction", start);
        cancellation.check()?;

        // Matching
        let start = Instant::now();
        let backend_names: Vec<String> = self.backends.iter().map(|b| b.name().to_string()).collect();
        let backend_hashes: Vec<u64> = self.backends.iter().map(|b| b.config_hash()).collect();
        let matches_fingerprint = fingerprint(&(
            "matches",
            pairs_fingerprint,
            &turns,
            &backend_names,
            &backend_hashes,
            &settings.matcher,
            settings.seed,
        ));
        let matches_path = scene_dir.join("matches.bin");
        let matches: MatchReport = match stage(overwrite, &matches_path, matches_fingerprint) {
            Some(matches) => matches,
            None => {
                let matcher = Matcher::new(settings.matcher.clone(), settings.seed);
                let matches = self.pool.install(|| {
                    matcher.match_all(&selection.pairs, &features, &images, &backend_names)
                });
                persist::store_stage(&matches_path, matches_fingerprint, &matches, attempts)?;
                matches
            }
        };
        for warning in &matches.warnings {
            report.warn(warning.clone());
        }
        report.dropped_pairs = matches
            .dropped
            .iter()
            .map(|pair| (image_name(&images, pair.first()), image_name(&images, pair.second())))
            .collect();
        report.timings.matching = finish_stage(&report.scene, "matching", start);
        cancellation.check()?;

        // Ensemble
        let start = Instant::now();
        let tracks_fingerprint = fingerprint(&("tracks", matches_fingerprint));
        let tracks_path = scene_dir.join("tracks.bin");
        let fusion: FusionResult = match stage(overwrite, &tracks_path, tracks_fingerprint) {
            Some(fusion) => fusion,
            None => {
                let fusion = fuse(&matches.verified, &KeypointLayout::new(&features));
                persist::store_stage(&tracks_path, tracks_fingerprint, &fusion, attempts)?;
                fusion
            }
        };
        drop(matches);
        info!(
            "fused {} correspondences of scene {} into {} tracks, {} rejected as conflicting",
            fusion.accepted,
            report.scene,
            fusion.tracks.len(),
            fusion.rejected
        );
        report.tracks = fusion.tracks.len();
        report.timings.ensemble = finish_stage(&report.scene, "ensemble", start);
        cancellation.check()?;

        // Structure from motion
        let start = Instant::now();
        let graph = SceneGraph::new(images.clone(), &features, fusion.tracks);
        drop(features);
        let sfm_fingerprint = fingerprint(&("sfm", tracks_fingerprint, images_fingerprint, &settings.sfm, settings.seed));
        let sfm_path = scene_dir.join("sfm.bin");
        let unrefined: Reconstruction = match stage(overwrite, &sfm_path, sfm_fingerprint) {
            Some(reconstruction) => reconstruction,
            None => {
                let reconstruction = SfmEngine::new(&graph, settings.sfm.clone(), settings.seed).run();
                persist::store_stage(&sfm_path, sfm_fingerprint, &reconstruction, attempts)?;
                reconstruction
            }
        };
        report.timings.sfm = finish_stage(&report.scene, "sfm", start);
        if unrefined.registered_count() == 0 {
            return Err(SceneError::NoRegisteredImages);
        }
        cancellation.check()?;

        // Refinement
        let start = Instant::now();
        let plan = refine::plan(
            images.len(),
            unrefined.observation_count(),
            self.config.refinement_memory_threshold,
            &self.refinement,
        );
        if let Some(warning) = plan.warning.clone() {
            report.warn(warning);
        }
        report.refinement = Some(plan.outcome);
        let mut reconstruction = if plan.outcome == RefinementOutcome::Skipped {
            info!("refinement of scene {} skipped", report.scene);
            unrefined
        } else {
            let refined_fingerprint =
                fingerprint(&("refined", sfm_fingerprint, &self.refinement, plan.outcome));
            let refined_path = scene_dir.join(format!("refined-{:016x}.bin", refined_fingerprint));
            let cached = if self.config.force_refinement {
                None
            } else {
                stage(overwrite, &refined_path, refined_fingerprint)
            };
            match cached {
                Some(refined) => refined,
                None => {
                    let mut refined = unrefined;
                    refine::refine(
                        &mut refined,
                        plan.outcome,
                        &self.refinement,
                        settings.sfm.loss_cutoff,
                    );
                    persist::store_stage(&refined_path, refined_fingerprint, &refined, attempts)?;
                    refined
                }
            }
        };
        report.timings.refinement = finish_stage(&report.scene, "refinement", start);
        cancellation.check()?;

        // Localization
        if self.config.localize_unregistered {
            let start = Instant::now();
            let mut engine =
                SfmEngine::resume(&graph, settings.sfm.clone(), settings.seed, reconstruction);
            match engine.localize_unregistered() {
                Ok(localized) => info!(
                    "localized {} more images of scene {}",
                    localized.len(),
                    report.scene
                ),
                Err(e) => warn!("localization of scene {} stopped: {}", report.scene, e),
            }
            reconstruction = engine.finish();
            report.timings.localization = finish_stage(&report.scene, "localization", start);
        }
        cancellation.check()?;

        for warning in registration_warnings(&reconstruction) {
            report.warn(warning);
        }
        report.registered = reconstruction.registered_count();
        report.unregistered = reconstruction
            .unregistered()
            .map(|(image, reason)| UnregisteredImage {
                image: image_name(&images, image),
                reason: reason.to_string(),
            })
            .collect();
        report.points = reconstruction.points.len();
        report.mean_reprojection_error = reconstruction.mean_reprojection_error();
        report.status = SceneStatus::Complete;

        persist::write_bincode(&scene_dir.join("reconstruction.bin"), &reconstruction, attempts)?;
        let ply = crate::export::reconstruction_ply(&reconstruction)?;
        persist::write_atomic(&scene_dir.join("points.ply"), &ply, attempts)?;
        persist::write_json(&summary_path, report, attempts)?;
        info!(
            "scene {} complete: {} of {} images registered, {} points, mean reprojection error {:.3}",
            report.scene,
            report.registered,
            report.images,
            report.points,
            report.mean_reprojection_error
        );
        Ok(())
    }
}

/// Loads a stage artifact unless overwriting.
fn stage<T: serde::de::DeserializeOwned>(overwrite: bool, path: &Path, fingerprint: u64) -> Option<T> {
    if overwrite {
        None
    } else {
        persist::load_stage(path, fingerprint)
    }
}

fn finish_stage(scene: &str, stage: &str, start: Instant) -> f64 {
    let seconds = start.elapsed().as_secs_f64();
    info!("{} of scene {} took {:.3}s", stage, scene, seconds);
    seconds
}

fn image_name(images: &[ImageInfo], image: ImageId) -> String {
    images
        .get(image.index())
        .map_or_else(|| image.to_string(), |info| info.name.clone())
}
