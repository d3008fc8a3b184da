use super::image::{gaussian_blur, gradients, local_maxima, GrayFloatImage};
use super::{hash_parameter, require_size, FeatureBackend};
use crate::ExtractionError;
use image::GrayImage;
use sfm_core::{Descriptors, ImageId, Keypoint, KeypointSet};

/// Harris corners described by a normalized grid of intensities around each corner.
///
/// The descriptor is not rotation invariant. Combine it with rotation normalization for
/// scenes photographed at arbitrary orientations.
#[derive(Debug, Clone, PartialEq)]
pub struct HarrisPatches {
    /// The maximum number of keypoints per image
    pub max_keypoints: usize,
    /// Integration scale of the structure tensor
    pub sigma: f32,
    /// Harris sensitivity `k` in `det - k * trace^2`
    pub k: f32,
    /// Corners below this fraction of the strongest response are ignored
    pub relative_threshold: f32,
    /// Radius of non-maximum suppression
    pub suppression_radius: usize,
    /// Half the side of the described patch
    pub patch_radius: usize,
}

impl Default for HarrisPatches {
    fn default() -> Self {
        Self {
            max_keypoints: 2000,
            sigma: 1.5,
            k: 0.04,
            relative_threshold: 0.01,
            suppression_radius: 3,
            patch_radius: 8,
        }
    }
}

/// Samples per side of the descriptor grid.
const GRID: usize = 8;

impl HarrisPatches {
    fn response(&self, image: &GrayFloatImage) -> GrayFloatImage {
        let (gx, gy) = gradients(image);
        let (width, height) = (image.width(), image.height());
        let mut xx = GrayFloatImage::new(width, height);
        let mut yy = GrayFloatImage::new(width, height);
        let mut xy = GrayFloatImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let (dx, dy) = (gx.get(x, y), gy.get(x, y));
                xx.put(x, y, dx * dx);
                yy.put(x, y, dy * dy);
                xy.put(x, y, dx * dy);
            }
        }
        let xx = gaussian_blur(&xx, self.sigma);
        let yy = gaussian_blur(&yy, self.sigma);
        let xy = gaussian_blur(&xy, self.sigma);
        let mut response = GrayFloatImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let (a, b, c) = (xx.get(x, y), yy.get(x, y), xy.get(x, y));
                let trace = a + b;
                response.put(x, y, a * b - c * c - self.k * trace * trace);
            }
        }
        response
    }

    fn describe(&self, smooth: &GrayFloatImage, x: usize, y: usize) -> Option<[f32; GRID * GRID]> {
        let step = (2 * self.patch_radius) as f32 / GRID as f32;
        let start = -(self.patch_radius as f32) + 0.5 * step;
        let mut descriptor = [0f32; GRID * GRID];
        for (ix, value) in descriptor.iter_mut().enumerate() {
            let dx = start + (ix % GRID) as f32 * step;
            let dy = start + (ix / GRID) as f32 * step;
            *value = smooth.sample(x as f32 + dx, y as f32 + dy);
        }
        let mean = descriptor.iter().sum::<f32>() / descriptor.len() as f32;
        descriptor.iter_mut().for_each(|v| *v -= mean);
        let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-4 {
            return None;
        }
        descriptor.iter_mut().for_each(|v| *v /= norm);
        Some(descriptor)
    }
}

impl FeatureBackend for HarrisPatches {
    fn name(&self) -> &str {
        "harris"
    }

    fn config_hash(&self) -> u64 {
        [
            ("max_keypoints", self.max_keypoints.to_string()),
            ("sigma", self.sigma.to_string()),
            ("k", self.k.to_string()),
            ("relative_threshold", self.relative_threshold.to_string()),
            ("suppression_radius", self.suppression_radius.to_string()),
            ("patch_radius", self.patch_radius.to_string()),
        ]
        .iter()
        .fold(0, |hash, (name, value)| hash_parameter(hash, name, value))
    }

    fn extract(&self, image: ImageId, pixels: &GrayImage) -> Result<KeypointSet, ExtractionError> {
        let margin = self.patch_radius + 1;
        require_size(self.name(), pixels, 2 * margin as u32 + 1)?;
        let float = GrayFloatImage::from_gray(pixels);
        let response = self.response(&float);
        let strongest = response.as_raw().iter().copied().fold(0f32, f32::max);
        let threshold = (strongest * self.relative_threshold).max(1e-10);
        let smooth = gaussian_blur(&float, 1.0);

        let mut set = KeypointSet::new(image, Descriptors::empty_float(GRID * GRID));
        for (x, y, value) in local_maxima(&response, self.suppression_radius, margin, threshold) {
            if set.len() >= self.max_keypoints {
                break;
            }
            if let Some(descriptor) = self.describe(&smooth, x, y) {
                set.keypoints
                    .push(Keypoint::new(x as f64, y as f64, value).with_scale(self.sigma));
                set.descriptors.push_float(&descriptor);
            }
        }
        Ok(set)
    }
}
