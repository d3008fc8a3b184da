//! A synthetic scene with exact ground truth and a backend that "detects" its points.
//!
//! World points lie on the two orthogonal planes `z = 5 + x` and `z = 5 - x`. Each of the
//! cameras looks at `(0, 0, 5)` from `(-1 + 0.5 i, 0.1 i, 0)`. The images written to disk are
//! plain gradients with the camera index in the top left pixel and the other corners saturated.
//! That is all the synthetic backend reads to produce the exact projections of the visible
//! points, also for images turned by the rotation normalizer.

#![allow(dead_code)]

use image::{GrayImage, Luma};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::nalgebra::{IsometryMatrix3, Point2, Point3, Vector3};
use sfm_core::{CameraIntrinsics, Descriptors, ImageId, Keypoint, KeypointSet, QuarterTurn, WorldToCamera};
use sfm_pipeline::{
    BackendRegistry, ExtractionError, FeatureBackend, Mode, RunConfig, RunSummary, SceneReport,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const FOCAL: f64 = 192.0;
pub const POINTS: usize = 400;
pub const DESCRIPTOR_SIZE: usize = 16;

pub fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(FOCAL, FOCAL, f64::from(WIDTH) / 2.0, f64::from(HEIGHT) / 2.0)
}

pub fn camera(ix: usize) -> WorldToCamera {
    let eye = Point3::new(-1.0 + 0.5 * ix as f64, 0.1 * ix as f64, 0.0);
    WorldToCamera(IsometryMatrix3::look_at_lh(
        &eye,
        &Point3::new(0.0, 0.0, 5.0),
        &Vector3::y(),
    ))
}

pub fn world_points() -> Vec<Point3<f64>> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
    (0..POINTS)
        .map(|_| {
            let x: f64 = rng.gen_range(-1.5..1.5);
            let y: f64 = rng.gen_range(-1.0..1.0);
            Point3::new(x, y, 5.0 + x.abs())
        })
        .collect()
}

fn descriptor(point: usize) -> Vec<f32> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(1000 + point as u64);
    let mut values: Vec<f32> = (0..DESCRIPTOR_SIZE)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    values.iter_mut().for_each(|v| *v /= norm);
    values
}

/// Value of the three corners of an image that do not hold the camera index.
pub const CORNER: u8 = 255;

/// Finds the corner holding the camera index and the quarter turn that moved it there from the
/// top left.
fn camera_marker(pixels: &GrayImage) -> (usize, QuarterTurn) {
    let (w, h) = pixels.dimensions();
    [
        (0, 0, QuarterTurn::R0),
        (w - 1, 0, QuarterTurn::R90),
        (w - 1, h - 1, QuarterTurn::R180),
        (0, h - 1, QuarterTurn::R270),
    ]
    .iter()
    .map(|&(x, y, turn)| (pixels.get_pixel(x, y)[0], turn))
    .find(|&(value, _)| value != CORNER)
    .map_or((0, QuarterTurn::R0), |(value, turn)| (usize::from(value), turn))
}

/// Where the original pixel `point` lands in an image turned clockwise by `turn`.
fn turned(turn: QuarterTurn, point: Point2<f64>) -> Point2<f64> {
    let (w, h) = (f64::from(WIDTH), f64::from(HEIGHT));
    match turn {
        QuarterTurn::R0 => point,
        QuarterTurn::R90 => Point2::new(h - 1.0 - point.y, point.x),
        QuarterTurn::R180 => Point2::new(w - 1.0 - point.x, h - 1.0 - point.y),
        QuarterTurn::R270 => Point2::new(point.y, w - 1.0 - point.x),
    }
}

/// Reads the camera index from the marked corner and returns the visible projections in the
/// frame of the image it was given, which may have been turned.
pub struct SyntheticBackend {
    points: Vec<Point3<f64>>,
    name: String,
    /// Only every n-th point is detected.
    every: usize,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self {
            points: world_points(),
            name: "synthetic".to_string(),
            every: 1,
        }
    }
}

impl SyntheticBackend {
    /// A backend detecting every `every`-th point, named `synthetic-<every>`.
    pub fn sparse(every: usize) -> Self {
        Self {
            name: format!("synthetic-{}", every),
            every,
            ..Self::default()
        }
    }
}

impl FeatureBackend for SyntheticBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn config_hash(&self) -> u64 {
        (POINTS * self.every) as u64
    }

    fn extract(&self, image: ImageId, pixels: &GrayImage) -> Result<KeypointSet, ExtractionError> {
        let (camera_ix, turn) = camera_marker(pixels);
        let pose = camera(camera_ix);
        let mut set = KeypointSet::new(image, Descriptors::empty_float(DESCRIPTOR_SIZE));
        for (ix, &point) in self.points.iter().enumerate().step_by(self.every) {
            let pixel = match pose.project(point) {
                Some(normalized) => intrinsics().uncalibrate(normalized).0,
                None => continue,
            };
            let inside = pixel.x >= 0.0
                && pixel.y >= 0.0
                && pixel.x < f64::from(WIDTH)
                && pixel.y < f64::from(HEIGHT);
            if inside {
                let pixel = turned(turn, pixel);
                set.keypoints.push(Keypoint::new(pixel.x, pixel.y, 1.0));
                set.descriptors.push_float(&descriptor(ix));
            }
        }
        Ok(set)
    }
}

pub fn registry() -> BackendRegistry {
    let mut registry = BackendRegistry::with_defaults();
    registry.register(Arc::new(SyntheticBackend::default()));
    registry.register(Arc::new(SyntheticBackend::sparse(2)));
    registry
}

pub fn image_name(ix: usize) -> String {
    format!("{:03}.png", ix)
}

/// Writes a scene of `cameras` images at `scene_dir` along with its intrinsics.
///
/// The images named in `corrupt` are written with bytes that do not decode.
pub fn write_scene(scene_dir: &Path, cameras: usize, corrupt: &[usize]) {
    write_scene_with_bright_left(scene_dir, cameras, corrupt, &[]);
}

/// Like [`write_scene`], with a bright band along the left border of the images in
/// `bright_left`.
pub fn write_scene_with_bright_left(scene_dir: &Path, cameras: usize, corrupt: &[usize], bright_left: &[usize]) {
    let images = scene_dir.join("images");
    fs::create_dir_all(&images).unwrap();
    let mut known = BTreeMap::new();
    for ix in 0..cameras {
        let path = images.join(image_name(ix));
        if corrupt.contains(&ix) {
            fs::write(&path, b"\x89PNG\r\n\x1a\nthis is not a png").unwrap();
        } else {
            let mut pixels = GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
                Luma([((x * 7 + y * 3 + ix as u32 * 29) % 200 + 20) as u8])
            });
            if bright_left.contains(&ix) {
                for y in 0..HEIGHT {
                    for x in 0..WIDTH / 4 {
                        pixels.put_pixel(x, y, Luma([250]));
                    }
                }
            }
            pixels.put_pixel(0, 0, Luma([ix as u8]));
            for (x, y) in [(WIDTH - 1, 0), (WIDTH - 1, HEIGHT - 1), (0, HEIGHT - 1)] {
                pixels.put_pixel(x, y, Luma([CORNER]));
            }
            pixels.save(&path).unwrap();
        }
        known.insert(image_name(ix), intrinsics());
    }
    fs::write(
        scene_dir.join("intrinsics.json"),
        serde_json::to_vec(&known).unwrap(),
    )
    .unwrap();
}

pub fn config(data_dir: &Path, output_dir: &Path) -> RunConfig {
    RunConfig {
        mode: Mode::Train,
        backends: vec!["synthetic".to_string()],
        ..RunConfig::new(data_dir, output_dir)
    }
}

pub fn scene<'a>(summary: &'a RunSummary, key: &str) -> &'a SceneReport {
    summary
        .scenes
        .iter()
        .find(|scene| scene.scene == key)
        .unwrap_or_else(|| panic!("scene {} missing from summary", key))
}

/// Every file under `dir` with its contents and modification time.
pub fn snapshot(dir: &Path) -> BTreeMap<PathBuf, (Vec<u8>, std::time::SystemTime)> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let modified = fs::metadata(&path).unwrap().modified().unwrap();
                files.insert(path.clone(), (fs::read(&path).unwrap(), modified));
            }
        }
    }
    files
}
