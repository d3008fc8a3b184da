use super::image::{gaussian_blur, gradients, GrayFloatImage};
use super::{hash_parameter, require_size, FeatureBackend};
use crate::ExtractionError;
use image::GrayImage;
use sfm_core::{Descriptors, ImageId, Keypoint, KeypointSet};

const CELLS: usize = 4;
const BINS: usize = 8;

/// Difference of Gaussian blobs over a single octave described by upright histograms of
/// gradient orientations on a `4x4` grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DogBlobs {
    /// The maximum number of keypoints per image
    pub max_keypoints: usize,
    /// The scale of the finest level
    pub base_sigma: f32,
    /// The number of difference of Gaussian levels
    pub levels: usize,
    /// Extrema with a smaller absolute response are ignored
    pub contrast_threshold: f32,
}

impl Default for DogBlobs {
    fn default() -> Self {
        Self {
            max_keypoints: 2000,
            base_sigma: 1.6,
            levels: 4,
            contrast_threshold: 0.01,
        }
    }
}

impl DogBlobs {
    fn sigma(&self, level: usize) -> f32 {
        self.base_sigma * std::f32::consts::SQRT_2.powi(level as i32)
    }

    fn window(&self, level: usize) -> usize {
        (2.0 * self.sigma(level)).ceil() as usize * 2
    }

    fn margin(&self) -> usize {
        self.window(self.levels) + 2
    }

    /// Is `dogs[level]` at `(x, y)` an extremum among its 26 neighbors in space and scale?
    fn is_extremum(dogs: &[GrayFloatImage], level: usize, x: usize, y: usize) -> bool {
        let value = dogs[level].get(x, y);
        let mut larger = true;
        let mut smaller = true;
        for neighbor_level in level - 1..=level + 1 {
            let dog = &dogs[neighbor_level];
            for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if neighbor_level == level && nx == x && ny == y {
                        continue;
                    }
                    let other = dog.get(nx, ny);
                    larger &= value > other;
                    smaller &= value < other;
                }
            }
            if !larger && !smaller {
                return false;
            }
        }
        larger || smaller
    }

    fn describe(
        &self,
        gx: &GrayFloatImage,
        gy: &GrayFloatImage,
        x: usize,
        y: usize,
        level: usize,
    ) -> Option<[f32; CELLS * CELLS * BINS]> {
        let half = self.window(level) as isize;
        let cell = (2 * half) as f32 / CELLS as f32;
        let mut histogram = [0f32; CELLS * CELLS * BINS];
        for dy in -half..half {
            for dx in -half..half {
                let (px, py) = (x as isize + dx, y as isize + dy);
                let (gdx, gdy) = (gx.get_clamped(px, py), gy.get_clamped(px, py));
                let magnitude = (gdx * gdx + gdy * gdy).sqrt();
                if magnitude == 0.0 {
                    continue;
                }
                let angle = gdy.atan2(gdx).rem_euclid(std::f32::consts::TAU);
                let bin = ((angle / std::f32::consts::TAU * BINS as f32) as usize).min(BINS - 1);
                let cx = (((dx + half) as f32 + 0.5) / cell) as usize;
                let cy = (((dy + half) as f32 + 0.5) / cell) as usize;
                let (cx, cy) = (cx.min(CELLS - 1), cy.min(CELLS - 1));
                histogram[(cy * CELLS + cx) * BINS + bin] += magnitude;
            }
        }
        normalize(&mut histogram)?;
        // Clamp large gradients so the descriptor is less sensitive to illumination.
        histogram.iter_mut().for_each(|v| *v = v.min(0.2));
        normalize(&mut histogram)?;
        Some(histogram)
    }
}

fn normalize(values: &mut [f32]) -> Option<()> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < 1e-6 {
        return None;
    }
    values.iter_mut().for_each(|v| *v /= norm);
    Some(())
}

impl FeatureBackend for DogBlobs {
    fn name(&self) -> &str {
        "dog"
    }

    fn config_hash(&self) -> u64 {
        [
            ("max_keypoints", self.max_keypoints.to_string()),
            ("base_sigma", self.base_sigma.to_string()),
            ("levels", self.levels.to_string()),
            ("contrast_threshold", self.contrast_threshold.to_string()),
        ]
        .iter()
        .fold(0, |hash, (name, value)| hash_parameter(hash, name, value))
    }

    fn extract(&self, image: ImageId, pixels: &GrayImage) -> Result<KeypointSet, ExtractionError> {
        let margin = self.margin();
        require_size(self.name(), pixels, 2 * margin as u32 + 1)?;
        let float = GrayFloatImage::from_gray(pixels);
        let (width, height) = (float.width(), float.height());

        let blurred: Vec<GrayFloatImage> = (0..=self.levels)
            .map(|level| gaussian_blur(&float, self.sigma(level)))
            .collect();
        let dogs: Vec<GrayFloatImage> = blurred
            .windows(2)
            .map(|pair| pair[1].difference(&pair[0]))
            .collect();

        let mut candidates = vec![];
        for level in 1..dogs.len().saturating_sub(1) {
            for y in margin..height - margin {
                for x in margin..width - margin {
                    let value = dogs[level].get(x, y);
                    if value.abs() > self.contrast_threshold
                        && Self::is_extremum(&dogs, level, x, y)
                    {
                        candidates.push((x, y, value.abs(), level));
                    }
                }
            }
        }
        candidates.sort_by(|a, b| {
            float_ord::FloatOrd(b.2)
                .cmp(&float_ord::FloatOrd(a.2))
                .then((a.1, a.0, a.3).cmp(&(b.1, b.0, b.3)))
        });

        let level_gradients: Vec<(GrayFloatImage, GrayFloatImage)> =
            blurred.iter().map(gradients).collect();
        let mut set = KeypointSet::new(image, Descriptors::empty_float(CELLS * CELLS * BINS));
        for (x, y, value, level) in candidates {
            if set.len() >= self.max_keypoints {
                break;
            }
            let (gx, gy) = &level_gradients[level];
            if let Some(descriptor) = self.describe(gx, gy, x, y, level) {
                set.keypoints.push(
                    Keypoint::new(x as f64, y as f64, value).with_scale(self.sigma(level)),
                );
                set.descriptors.push_float(&descriptor);
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_image() -> GrayImage {
        GrayImage::from_fn(96, 96, |x, y| {
            let dx = x as f32 - 48.0;
            let dy = y as f32 - 40.0;
            let v = 200.0 * (-(dx * dx + dy * dy) / (2.0 * 16.0)).exp();
            image::Luma([20 + v as u8])
        })
    }

    #[test]
    fn finds_a_gaussian_blob() {
        let set = DogBlobs::default().extract(ImageId(3), &blob_image()).unwrap();
        assert!(!set.is_empty());
        let best = set.keypoints[0].point;
        assert!((best.x - 48.0).abs() <= 1.0 && (best.y - 40.0).abs() <= 1.0);
        assert_eq!(set.image, ImageId(3));
    }

    #[test]
    fn extraction_is_deterministic() {
        let backend = DogBlobs::default();
        let a = backend.extract(ImageId(0), &blob_image()).unwrap();
        let b = backend.extract(ImageId(0), &blob_image()).unwrap();
        assert_eq!(a, b);
    }
}
