//! Incremental structure from motion over the fused track graph.
//!
//! Registration is a loop of small steps on a shared [`Reconstruction`]:
//!
//! 1. [`SfmEngine::initialize`] picks a seed pair, estimates its relative pose from the essential
//!    matrix and triangulates their common tracks.
//! 2. [`SfmEngine::next_candidate`] picks the unregistered image observing the most triangulated
//!    tracks and [`SfmEngine::register_image`] estimates its pose from those 2d-3d matches and
//!    triangulates the tracks it completes.
//! 3. Every few registrations the whole reconstruction is bundle adjusted.
//!
//! Every image follows its own [`RegistrationState`] machine. Images that fail may be retried
//! once more tracks are triangulated, and images that never register are recorded as
//! unregistered along with the reason.

use crate::features::SceneFeatures;
use crate::{SceneWarning, SfmSettings};
use arrsac::Arrsac;
use itertools::Itertools;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use sample_consensus::{Consensus, Estimator};
use sfm_core::nalgebra::Point3;
use sfm_core::{
    BackendId, ImageId, ImageInfo, InvalidTransition, KeyPoint, Observation, PairKey, Point3D,
    PointObservation, Pose, Reconstruction, RegisteredCamera, RegistrationState, Track, TrackId,
    WorldToCamera,
};
use sfm_geom::{
    triangulation_angle, BundleAdjustScope, BundleAdjuster, DltResection, EightPoint,
    LinearEigenTriangulator, NormalizedMatch, WorldMatch,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Why an image could not be registered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error("no image pair shares enough tracks to start the reconstruction")]
    NoSeedPair,
    #[error("the image has no keypoints from any backend")]
    NoKeypoints,
    #[error("only {found} correspondences to triangulated points but {required} are required")]
    TooFewCorrespondences { found: usize, required: usize },
    #[error("pose estimation failed on {correspondences} correspondences")]
    PoseEstimationFailed { correspondences: usize },
    #[error("only {inliers} pose inliers but {required} are required")]
    TooFewInliers { inliers: usize, required: usize },
    #[error("degenerate seed geometry: median triangulation angle {angle:.2} degrees")]
    DegenerateGeometry { angle: f64 },
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

/// The fused keypoints and tracks of a scene in the form the engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneGraph {
    pub images: Vec<ImageInfo>,
    /// The fused keypoint list of every image in the original pixel frame.
    pub keypoints: Vec<Vec<KeyPoint>>,
    /// Indexed by track id.
    pub tracks: Vec<Track>,
    /// The track of every keypoint of an image that belongs to one.
    image_tracks: Vec<Vec<(u32, TrackId)>>,
}

impl SceneGraph {
    /// Concatenates the keypoints of every backend in backend order, which is the layout the
    /// tracks refer to.
    pub fn new(images: Vec<ImageInfo>, features: &SceneFeatures, tracks: Vec<Track>) -> Self {
        let keypoints = images
            .iter()
            .map(|info| {
                (0..features.backends())
                    .filter_map(|backend| features.get(BackendId(backend as u8), info.id))
                    .flat_map(|set| set.keypoints.iter().map(|kp| kp.point))
                    .collect()
            })
            .collect();
        let tracks: Vec<Track> = tracks
            .into_iter()
            .enumerate()
            .map(|(ix, track)| Track {
                id: TrackId(ix as u32),
                ..track
            })
            .collect();
        let mut image_tracks = vec![vec![]; images.len()];
        for track in &tracks {
            for observation in &track.observations {
                if let Some(list) = image_tracks.get_mut(observation.image.index()) {
                    list.push((observation.keypoint, track.id));
                }
            }
        }
        Self {
            images,
            keypoints,
            tracks,
            image_tracks,
        }
    }

    pub fn pixel(&self, observation: Observation) -> Option<KeyPoint> {
        self.keypoints
            .get(observation.image.index())?
            .get(observation.keypoint as usize)
            .copied()
    }

    pub fn track(&self, track: TrackId) -> &Track {
        &self.tracks[track.index()]
    }

    /// The tracks an image takes part in along with its keypoint in each.
    pub fn tracks_of(&self, image: ImageId) -> &[(u32, TrackId)] {
        self.image_tracks
            .get(image.index())
            .map_or(&[][..], Vec::as_slice)
    }

    /// Image pairs ordered by how many tracks they share, most first, ties by key.
    pub fn covisibility(&self) -> Vec<(PairKey, usize)> {
        let mut shared: BTreeMap<PairKey, usize> = BTreeMap::new();
        for track in &self.tracks {
            for (a, b) in track.images().tuple_combinations() {
                if let Some(key) = PairKey::new(a, b) {
                    *shared.entry(key).or_default() += 1;
                }
            }
        }
        shared
            .into_iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
            .collect()
    }
}

/// A camera pose found by resection along with the tracks supporting it.
struct Resection {
    camera: RegisteredCamera,
    inliers: Vec<(TrackId, Observation)>,
}

/// Registers the images of one scene into a reconstruction.
pub struct SfmEngine<'a> {
    graph: &'a SceneGraph,
    settings: SfmSettings,
    seed: u64,
    reconstruction: Reconstruction,
    states: Vec<RegistrationState>,
    /// The number of 2d-3d correspondences at the last failed attempt and why it failed.
    failures: BTreeMap<ImageId, (usize, RegistrationError)>,
    /// Cameras held fixed during bundle adjustment.
    fixed: BTreeSet<ImageId>,
    since_bundle_adjust: usize,
    triangulator: LinearEigenTriangulator,
}

impl<'a> SfmEngine<'a> {
    pub fn new(graph: &'a SceneGraph, settings: SfmSettings, seed: u64) -> Self {
        Self::resume(graph, settings, seed, Reconstruction::new(graph.images.clone()))
    }

    /// Continues from an existing reconstruction of the same scene.
    pub fn resume(
        graph: &'a SceneGraph,
        settings: SfmSettings,
        seed: u64,
        reconstruction: Reconstruction,
    ) -> Self {
        let states = graph
            .images
            .iter()
            .map(|info| {
                if reconstruction.is_registered(info.id) {
                    RegistrationState::Registered
                } else {
                    RegistrationState::Unregistered
                }
            })
            .collect();
        let fixed = reconstruction.cameras.keys().take(1).copied().collect();
        Self {
            graph,
            settings,
            seed,
            reconstruction,
            states,
            failures: BTreeMap::new(),
            fixed,
            since_bundle_adjust: 0,
            triangulator: LinearEigenTriangulator::new(),
        }
    }

    pub fn reconstruction(&self) -> &Reconstruction {
        &self.reconstruction
    }

    pub fn state(&self, image: ImageId) -> RegistrationState {
        self.states
            .get(image.index())
            .copied()
            .unwrap_or_default()
    }

    /// Runs the complete incremental registration and returns the reconstruction.
    ///
    /// Every image is either registered or marked unregistered with a reason afterwards.
    pub fn run(mut self) -> Reconstruction {
        match self.initialize() {
            Ok(seed) => {
                while let Some((image, _)) = self.next_candidate() {
                    if let Err(e) = self.register_image(image) {
                        info!("image {} not registered yet: {}", image, e);
                    }
                }
                if self.since_bundle_adjust > 0 {
                    self.bundle_adjust();
                }
                info!(
                    "registered {} of {} images starting from {:?} with {} points",
                    self.reconstruction.registered_count(),
                    self.graph.images.len(),
                    seed,
                    self.reconstruction.points.len()
                );
            }
            Err(e) => warn!("unable to start the reconstruction: {}", e),
        }
        self.finish()
    }

    /// Marks every image that is not registered with the reason and returns the reconstruction.
    pub fn finish(mut self) -> Reconstruction {
        for info in &self.graph.images {
            let image = info.id;
            if self.reconstruction.is_registered(image) {
                continue;
            }
            let reason = if self.graph.keypoints[image.index()].is_empty() {
                RegistrationError::NoKeypoints.to_string()
            } else if let Some((_, error)) = self.failures.get(&image) {
                error.to_string()
            } else if self.reconstruction.registered_count() == 0 {
                RegistrationError::NoSeedPair.to_string()
            } else {
                RegistrationError::TooFewCorrespondences {
                    found: self.correspondence_count(image),
                    required: self.settings.pnp_min_inliers,
                }
                .to_string()
            };
            self.reconstruction.mark_unregistered(image, reason);
        }
        self.reconstruction
    }

    /// Registers the first two images.
    ///
    /// Precondition: nothing is registered. Postcondition on success: both images of the returned
    /// pair are registered and their common tracks triangulated.
    pub fn initialize(&mut self) -> Result<PairKey, RegistrationError> {
        let candidates: Vec<PairKey> = self
            .graph
            .covisibility()
            .into_iter()
            .take_while(|&(_, shared)| shared >= self.settings.seed_min_inliers)
            .take(self.settings.seed_candidates)
            .map(|(pair, _)| pair)
            .collect();
        for pair in candidates {
            match self.try_seed(pair) {
                Ok(()) => return Ok(pair),
                Err(e) => info!("rejecting seed pair {:?}: {}", pair, e),
            }
        }
        Err(RegistrationError::NoSeedPair)
    }

    fn try_seed(&mut self, pair: PairKey) -> Result<(), RegistrationError> {
        let graph = self.graph;
        let (a, b) = (pair.first(), pair.second());
        let intrinsics_a = graph.images[a.index()].intrinsics();
        let intrinsics_b = graph.images[b.index()].intrinsics();
        let matches: Vec<NormalizedMatch> = graph
            .tracks_of(a)
            .iter()
            .filter_map(|&(keypoint, track)| {
                let other = graph.track(track).observation(b)?;
                let pa = graph.pixel(Observation { image: a, keypoint })?;
                let pb = graph.pixel(other)?;
                Some(NormalizedMatch(
                    intrinsics_a.calibrate(pa),
                    intrinsics_b.calibrate(pb),
                ))
            })
            .collect();
        info!("estimate essential on {} matches of {:?}", matches.len(), pair);

        let threshold =
            self.settings.pnp_threshold / (0.5 * (intrinsics_a.focal() + intrinsics_b.focal()));
        let mut arrsac = Arrsac::new(threshold, self.rng(pair.stable_hash()));
        let (essential, inliers) = arrsac
            .model_inliers(&EightPoint::new(), matches.iter().copied())
            .ok_or(RegistrationError::PoseEstimationFailed {
                correspondences: matches.len(),
            })?;
        if inliers.len() < self.settings.seed_min_inliers {
            return Err(RegistrationError::TooFewInliers {
                inliers: inliers.len(),
                required: self.settings.seed_min_inliers,
            });
        }
        let (relative, _) = essential
            .solve_pose(
                inliers.iter().map(|&ix| matches[ix]),
                &self.triangulator,
                1e-12,
                1000,
            )
            .ok_or(RegistrationError::PoseEstimationFailed {
                correspondences: inliers.len(),
            })?;

        let pose_a = WorldToCamera::identity();
        let pose_b = WorldToCamera::from(relative);
        let (center_a, center_b) = (pose_a.optical_center(), pose_b.optical_center());
        let mut angles: Vec<f64> = inliers
            .iter()
            .filter_map(|&ix| {
                let NormalizedMatch(na, nb) = matches[ix];
                let point = self.triangulator.triangulate_relative(relative, na, nb)?;
                Some(triangulation_angle(center_a, center_b, point).to_degrees())
            })
            .collect();
        let median = match median(&mut angles) {
            Some(median) if angles.len() >= self.settings.pnp_min_inliers => median,
            _ => {
                return Err(RegistrationError::TooFewInliers {
                    inliers: angles.len(),
                    required: self.settings.pnp_min_inliers.max(1),
                })
            }
        };
        if median < self.settings.seed_min_angle_degrees {
            return Err(RegistrationError::DegenerateGeometry { angle: median });
        }

        for (image, pose, intrinsics) in [(a, pose_a, intrinsics_a), (b, pose_b, intrinsics_b)] {
            self.transition(image, RegistrationState::begin)?;
            self.reconstruction
                .register(image, RegisteredCamera { pose, intrinsics });
            self.transition(image, RegistrationState::succeed)?;
        }
        self.fixed = [a].into_iter().collect();
        let triangulated = self.triangulate_tracks_of(b);
        info!(
            "seeded reconstruction with {:?} from {} essential inliers, median angle {:.2} degrees, {} points",
            pair,
            inliers.len(),
            median,
            triangulated
        );
        self.bundle_adjust();
        Ok(())
    }

    /// The number of tracks of an image that already have a 3d point.
    pub fn correspondence_count(&self, image: ImageId) -> usize {
        self.graph
            .tracks_of(image)
            .iter()
            .filter(|(_, track)| self.reconstruction.points.contains_key(track))
            .count()
    }

    /// The unregistered image with the most 2d-3d correspondences, ties broken by id.
    ///
    /// Images that failed before are only proposed again once they gained correspondences, so
    /// the registration loop always terminates.
    pub fn next_candidate(&self) -> Option<(ImageId, usize)> {
        self.graph
            .images
            .iter()
            .map(|info| info.id)
            .filter(|&image| !self.state(image).is_registered())
            .map(|image| (image, self.correspondence_count(image)))
            .filter(|&(image, count)| {
                count >= self.settings.pnp_min_inliers
                    && self
                        .failures
                        .get(&image)
                        .map_or(true, |&(previous, _)| count > previous)
            })
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    }

    /// Estimates the pose of one image from its 2d-3d correspondences and adds it.
    ///
    /// Precondition: the image is not registered. Postcondition: the image is `Registered`, its
    /// correspondences are observations of their points and the tracks it completes are
    /// triangulated, or it is `Failed` and the reconstruction is unchanged.
    pub fn register_image(&mut self, image: ImageId) -> Result<(), RegistrationError> {
        self.transition(image, RegistrationState::begin)?;
        let count = self.correspondence_count(image);
        let resection = match self.resect(
            image,
            self.settings.pnp_threshold,
            self.settings.pnp_min_inliers,
        ) {
            Ok(resection) => resection,
            Err(e) => {
                self.transition(image, RegistrationState::fail)?;
                self.failures.insert(image, (count, e.clone()));
                return Err(e);
            }
        };
        self.reconstruction.register(image, resection.camera);
        self.transition(image, RegistrationState::succeed)?;
        self.failures.remove(&image);

        for &(track, observation) in &resection.inliers {
            if let (Some(point), Some(pixel)) = (
                self.reconstruction.points.get_mut(&track),
                self.graph.pixel(observation),
            ) {
                point.observations.push(PointObservation {
                    image,
                    keypoint: observation.keypoint,
                    pixel,
                });
            }
        }
        let triangulated = self.triangulate_tracks_of(image);
        info!(
            "registered image {} with {} of {} correspondences and triangulated {} new points",
            image,
            resection.inliers.len(),
            count,
            triangulated
        );

        self.since_bundle_adjust += 1;
        if self.since_bundle_adjust >= self.settings.ba_interval.max(1) {
            self.bundle_adjust();
        }
        Ok(())
    }

    /// Tries to localize every unregistered image against the reconstruction with the relaxed
    /// localization thresholds. No points are added or changed.
    ///
    /// Returns the images that were localized.
    pub fn localize_unregistered(&mut self) -> Result<Vec<ImageId>, RegistrationError> {
        let unregistered: Vec<ImageId> = self
            .graph
            .images
            .iter()
            .map(|info| info.id)
            .filter(|&image| !self.state(image).is_registered())
            .collect();
        let mut localized = vec![];
        for image in unregistered {
            self.transition(image, RegistrationState::begin)?;
            match self.resect(
                image,
                self.settings.localization_threshold,
                self.settings.localization_min_inliers,
            ) {
                Ok(resection) => {
                    self.reconstruction.register(image, resection.camera);
                    self.transition(image, RegistrationState::succeed)?;
                    self.failures.remove(&image);
                    info!(
                        "localized image {} with {} inliers",
                        image,
                        resection.inliers.len()
                    );
                    localized.push(image);
                }
                Err(e) => {
                    info!("unable to localize image {}: {}", image, e);
                    let count = self.correspondence_count(image);
                    self.failures.insert(image, (count, e));
                    self.transition(image, RegistrationState::fail)?;
                }
            }
        }
        Ok(localized)
    }

    /// Bundle adjusts every camera and point, then removes observations that stayed outliers.
    pub fn bundle_adjust(&mut self) {
        BundleAdjuster::new()
            .loss_cutoff(self.settings.loss_cutoff)
            .bundle_adjust(
                &mut self.reconstruction,
                self.settings.ba_rounds,
                BundleAdjustScope {
                    fixed_cameras: Some(&self.fixed),
                    tracks: None,
                },
            );
        self.since_bundle_adjust = 0;
        self.filter_observations();
    }

    /// Removes observations with a large reprojection error and points left with fewer than two.
    fn filter_observations(&mut self) {
        let max_error = self.settings.max_reprojection_error;
        let cameras = &self.reconstruction.cameras;
        let mut removed = 0;
        for point in self.reconstruction.points.values_mut() {
            let before = point.observations.len();
            let position = point.position;
            point.observations.retain(|obs| {
                cameras
                    .get(&obs.image)
                    .map_or(false, |camera| camera.reprojection_error(position, obs.pixel) <= max_error)
            });
            removed += before - point.observations.len();
        }
        let points_before = self.reconstruction.points.len();
        self.reconstruction
            .points
            .retain(|_, point| point.observations.len() >= 2);
        self.reconstruction.update_point_errors();
        if removed > 0 {
            info!(
                "filtered {} observations and {} points",
                removed,
                points_before - self.reconstruction.points.len()
            );
        }
    }

    fn resect(
        &self,
        image: ImageId,
        threshold: f64,
        min_inliers: usize,
    ) -> Result<Resection, RegistrationError> {
        let intrinsics = self.graph.images[image.index()].intrinsics();
        let mut correspondences: Vec<(TrackId, Observation, Point3<f64>, KeyPoint)> = vec![];
        for &(keypoint, track) in self.graph.tracks_of(image) {
            let observation = Observation { image, keypoint };
            if let (Some(point), Some(pixel)) = (
                self.reconstruction.points.get(&track),
                self.graph.pixel(observation),
            ) {
                correspondences.push((track, observation, point.position, pixel));
            }
        }
        let required = min_inliers.max(<DltResection as Estimator<WorldMatch>>::MIN_SAMPLES);
        if correspondences.len() < required {
            return Err(RegistrationError::TooFewCorrespondences {
                found: correspondences.len(),
                required,
            });
        }

        let matches: Vec<WorldMatch> = correspondences
            .iter()
            .map(|&(_, _, world, pixel)| WorldMatch(intrinsics.calibrate(pixel), world))
            .collect();
        let mut arrsac = Arrsac::new(
            threshold / intrinsics.focal(),
            self.rng(u64::from(image.0).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
        );
        let (pose, inliers) = arrsac
            .model_inliers(&DltResection::new(), matches.iter().copied())
            .ok_or(RegistrationError::PoseEstimationFailed {
                correspondences: correspondences.len(),
            })?;
        if inliers.len() < min_inliers {
            return Err(RegistrationError::TooFewInliers {
                inliers: inliers.len(),
                required: min_inliers,
            });
        }

        let observed: Vec<(Point3<f64>, KeyPoint)> = inliers
            .iter()
            .map(|&ix| (correspondences[ix].2, correspondences[ix].3))
            .collect();
        let camera = RegisteredCamera {
            pose: BundleAdjuster::new()
                .loss_cutoff(self.settings.loss_cutoff)
                .refine_pose(RegisteredCamera { pose, intrinsics }, &observed),
            intrinsics,
        };
        let inliers: Vec<(TrackId, Observation)> = correspondences
            .iter()
            .filter(|&&(_, _, world, pixel)| camera.reprojection_error(world, pixel) <= threshold)
            .map(|&(track, observation, _, _)| (track, observation))
            .collect();
        if inliers.len() < min_inliers {
            return Err(RegistrationError::TooFewInliers {
                inliers: inliers.len(),
                required: min_inliers,
            });
        }
        Ok(Resection { camera, inliers })
    }

    /// Triangulates every track of `image` that has no point yet but two registered observations.
    ///
    /// Returns the number of new points.
    fn triangulate_tracks_of(&mut self, image: ImageId) -> usize {
        let candidates: Vec<TrackId> = self
            .graph
            .tracks_of(image)
            .iter()
            .map(|&(_, track)| track)
            .filter(|track| !self.reconstruction.points.contains_key(track))
            .collect();
        let mut added = 0;
        for track in candidates {
            if let Some(point) = self.triangulate_track(track) {
                self.reconstruction.points.insert(track, point);
                added += 1;
            }
        }
        added
    }

    fn triangulate_track(&self, track: TrackId) -> Option<Point3D> {
        let observed: Vec<(RegisteredCamera, PointObservation)> = self
            .graph
            .track(track)
            .observations
            .iter()
            .filter_map(|&observation| {
                let camera = *self.reconstruction.cameras.get(&observation.image)?;
                let pixel = self.graph.pixel(observation)?;
                Some((
                    camera,
                    PointObservation {
                        image: observation.image,
                        keypoint: observation.keypoint,
                        pixel,
                    },
                ))
            })
            .collect();
        if observed.len() < 2 {
            return None;
        }
        let position = self.triangulator.triangulate_observations(
            observed
                .iter()
                .map(|(camera, obs)| (camera.pose, camera.intrinsics.calibrate(obs.pixel))),
        )?;

        let widest = observed
            .iter()
            .tuple_combinations()
            .map(|((a, _), (b, _))| {
                triangulation_angle(a.pose.optical_center(), b.pose.optical_center(), position)
            })
            .fold(0.0, f64::max);
        if widest.to_degrees() < self.settings.min_triangulation_angle_degrees {
            return None;
        }

        let errors: Vec<f64> = observed
            .iter()
            .map(|(camera, obs)| camera.reprojection_error(position, obs.pixel))
            .collect();
        let observations: Vec<PointObservation> = observed
            .iter()
            .zip(&errors)
            .filter(|(_, &error)| error <= self.settings.max_reprojection_error)
            .map(|((_, obs), _)| *obs)
            .collect();
        if observations.len() < 2 {
            return None;
        }
        let kept: Vec<f64> = errors
            .into_iter()
            .filter(|&error| error <= self.settings.max_reprojection_error)
            .collect();
        Some(Point3D {
            position,
            error: kept.iter().sum::<f64>() / kept.len() as f64,
            observations,
        })
    }

    fn transition(
        &mut self,
        image: ImageId,
        step: fn(&mut RegistrationState) -> Result<(), InvalidTransition>,
    ) -> Result<(), RegistrationError> {
        match self.states.get_mut(image.index()) {
            Some(state) => Ok(step(state)?),
            None => Ok(()),
        }
    }

    fn rng(&self, salt: u64) -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(self.seed ^ salt)
    }
}

/// The middle element after sorting, or `None` for no values.
fn median(values: &mut [f64]) -> Option<f64> {
    values.sort_by_key(|&value| float_ord::FloatOrd(value));
    values.get(values.len() / 2).copied()
}

/// A [`SceneWarning::RegistrationFailure`] for every unregistered image of the reconstruction.
pub fn registration_warnings(reconstruction: &Reconstruction) -> Vec<SceneWarning> {
    reconstruction
        .unregistered()
        .map(|(image, reason)| SceneWarning::RegistrationFailure {
            image: reconstruction
                .image(image)
                .map_or_else(|| image.to_string(), |info| info.name.clone()),
            reason: reason.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng};
    use sfm_core::nalgebra::{IsometryMatrix3, Vector3};
    use sfm_core::{CameraIntrinsics, Descriptors, Keypoint, KeypointSet};

    const FOCAL: f64 = 192.0;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(FOCAL, FOCAL, 80.0, 60.0)
    }

    fn pose(ix: usize) -> WorldToCamera {
        let eye = Point3::new(-1.0 + 0.5 * ix as f64, 0.1 * ix as f64, 0.0);
        WorldToCamera(IsometryMatrix3::look_at_lh(
            &eye,
            &Point3::new(0.0, 0.0, 5.0),
            &Vector3::y(),
        ))
    }

    /// Every point is seen by every camera. `blind` images get no keypoints at all.
    fn scene(cameras: usize, points: usize, blind: &[usize]) -> SceneGraph {
        scene_where(cameras, points, |camera, _| !blind.contains(&camera))
    }

    /// Camera `c` observes point `p` when `sees(c, p)`. Cameras that see nothing get no keypoints.
    fn scene_where(cameras: usize, points: usize, sees: impl Fn(usize, usize) -> bool) -> SceneGraph {
        let mut rng = SmallRng::seed_from_u64(11);
        let world: Vec<Point3<f64>> = (0..points)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(4.0..6.0),
                )
            })
            .collect();
        let images: Vec<ImageInfo> = (0..cameras)
            .map(|ix| ImageInfo {
                id: ImageId(ix as u32),
                name: format!("{:03}.png", ix),
                width: 160,
                height: 120,
                known_intrinsics: Some(intrinsics()),
            })
            .collect();
        let mut features = SceneFeatures::new(1, cameras);
        let mut tracks = vec![];
        for ix in 0..cameras {
            if !(0..points).any(|point| sees(ix, point)) {
                continue;
            }
            let pose = pose(ix);
            let mut set = KeypointSet::new(ImageId(ix as u32), Descriptors::empty_float(1));
            for &point in &world {
                let normalized = pose.project(point).unwrap();
                let pixel = intrinsics().uncalibrate(normalized);
                set.keypoints.push(Keypoint::new(pixel.0.x, pixel.0.y, 1.0));
            }
            features.insert(BackendId(0), set);
        }
        for point in 0..points {
            let observations: Vec<Observation> = (0..cameras)
                .filter(|&ix| sees(ix, point))
                .map(|ix| Observation {
                    image: ImageId(ix as u32),
                    keypoint: point as u32,
                })
                .collect();
            tracks.push(Track {
                id: TrackId(0),
                observations,
            });
        }
        SceneGraph::new(images, &features, tracks)
    }

    #[test]
    fn scene_graph_indexes_tracks() {
        let graph = scene(3, 20, &[]);
        assert_eq!(graph.tracks[7].id, TrackId(7));
        assert_eq!(graph.tracks_of(ImageId(2)).len(), 20);
        assert_eq!(graph.tracks_of(ImageId(9)).len(), 0);
        let covisibility = graph.covisibility();
        assert_eq!(covisibility.len(), 3);
        assert!(covisibility.iter().all(|&(_, shared)| shared == 20));
        assert_eq!(covisibility[0].0, PairKey::new(ImageId(0), ImageId(1)).unwrap());
    }

    #[test]
    fn registers_every_camera() {
        let graph = scene(5, 200, &[]);
        let reconstruction = SfmEngine::new(&graph, SfmSettings::default(), 7).run();
        assert_eq!(reconstruction.registered_count(), 5);
        assert!(reconstruction.points.len() > 150);
        assert!(reconstruction.mean_reprojection_error() < 0.5);
        assert_eq!(reconstruction.unregistered().count(), 0);
    }

    #[test]
    fn blind_image_is_unregistered_with_reason() {
        let graph = scene(5, 200, &[3]);
        let mut engine = SfmEngine::new(&graph, SfmSettings::default(), 7);
        engine.initialize().unwrap();
        while let Some((image, _)) = engine.next_candidate() {
            engine.register_image(image).unwrap();
        }
        assert_eq!(engine.state(ImageId(3)), RegistrationState::Unregistered);
        assert!(engine.localize_unregistered().unwrap().is_empty());
        assert_eq!(engine.state(ImageId(3)), RegistrationState::Failed);

        let reconstruction = engine.finish();
        assert_eq!(reconstruction.registered_count(), 4);
        let unregistered: Vec<(ImageId, &str)> = reconstruction.unregistered().collect();
        assert_eq!(unregistered.len(), 1);
        assert_eq!(unregistered[0].0, ImageId(3));
        assert!(unregistered[0].1.contains("no keypoints"));
        let warnings = registration_warnings(&reconstruction);
        assert!(matches!(
            &warnings[..],
            [SceneWarning::RegistrationFailure { image, .. }] if image == "003.png"
        ));
    }

    #[test]
    fn localization_registers_images_with_few_correspondences() {
        // Image 4 sees too few points for regular registration but enough to be localized.
        let graph = scene_where(5, 200, |camera, point| camera != 4 || point < 40);
        let settings = SfmSettings {
            pnp_min_inliers: 60,
            localization_min_inliers: 20,
            ..SfmSettings::default()
        };
        let mut engine = SfmEngine::new(&graph, settings, 7);
        engine.initialize().unwrap();
        while let Some((image, _)) = engine.next_candidate() {
            engine.register_image(image).unwrap();
        }
        assert_eq!(engine.state(ImageId(4)), RegistrationState::Unregistered);
        assert_eq!(engine.localize_unregistered().unwrap(), vec![ImageId(4)]);
        assert_eq!(engine.state(ImageId(4)), RegistrationState::Registered);

        let reconstruction = engine.finish();
        assert_eq!(reconstruction.registered_count(), 5);
        assert_eq!(reconstruction.unregistered().count(), 0);
        let camera = &reconstruction.cameras[&ImageId(4)];
        assert!(camera.pose.optical_center().coords.norm() > 0.5);
    }

    #[test]
    fn failed_localization_can_be_retried() {
        let graph = scene(4, 150, &[2]);
        let mut engine = SfmEngine::new(&graph, SfmSettings::default(), 5);
        engine.initialize().unwrap();
        while let Some((image, _)) = engine.next_candidate() {
            engine.register_image(image).unwrap();
        }
        assert!(engine.localize_unregistered().unwrap().is_empty());
        assert_eq!(engine.state(ImageId(2)), RegistrationState::Failed);
        assert!(engine.localize_unregistered().unwrap().is_empty());
        assert_eq!(engine.state(ImageId(2)), RegistrationState::Failed);
    }

    #[test]
    fn median_of_no_angles_is_none() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn zero_minimum_inliers_registers_without_panicking() {
        let graph = scene(4, 150, &[3]);
        let settings = SfmSettings {
            pnp_min_inliers: 0,
            ..SfmSettings::default()
        };
        let reconstruction = SfmEngine::new(&graph, settings, 7).run();
        assert_eq!(reconstruction.registered_count(), 3);
        assert!(!reconstruction.is_registered(ImageId(3)));
    }

    #[test]
    fn registered_images_cannot_register_again() {
        let graph = scene(3, 100, &[]);
        let mut engine = SfmEngine::new(&graph, SfmSettings::default(), 7);
        let seed = engine.initialize().unwrap();
        assert!(matches!(
            engine.register_image(seed.first()),
            Err(RegistrationError::InvalidTransition(_))
        ));
        assert_eq!(engine.reconstruction().registered_count(), 2);
    }

    #[test]
    fn resume_keeps_registered_cameras() {
        let graph = scene(4, 150, &[]);
        let first = SfmEngine::new(&graph, SfmSettings::default(), 3).run();
        let resumed = SfmEngine::resume(&graph, SfmSettings::default(), 3, first.clone());
        assert_eq!(resumed.state(ImageId(2)), RegistrationState::Registered);
        assert!(resumed.next_candidate().is_none());
        assert_eq!(resumed.finish().cameras, first.cameras);
    }

    #[test]
    fn runs_are_reproducible() {
        let graph = scene(4, 150, &[]);
        let a = SfmEngine::new(&graph, SfmSettings::default(), 9).run();
        let b = SfmEngine::new(&graph, SfmSettings::default(), 9).run();
        assert_eq!(a, b);
    }
}
