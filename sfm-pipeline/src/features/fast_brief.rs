use super::image::{gaussian_blur, local_maxima, GrayFloatImage};
use super::{hash_parameter, require_size, FeatureBackend};
use crate::ExtractionError;
use image::GrayImage;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use sfm_core::{
    BinaryDescriptor, Descriptors, ImageId, Keypoint, KeypointSet, BINARY_DESCRIPTOR_BYTES,
};

/// The Bresenham circle of radius 3 used by the FAST segment test, clockwise from the top.
const CIRCLE: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// FAST corners with an intensity centroid orientation and a steered BRIEF binary descriptor.
///
/// Descriptors are compared with the hamming distance.
#[derive(Debug, Clone, PartialEq)]
pub struct FastBrief {
    /// The maximum number of keypoints per image
    pub max_keypoints: usize,
    /// Intensity difference in `[0, 1]` a circle pixel needs to count as brighter or darker
    pub threshold: f32,
    /// The number of contiguous circle pixels required
    pub arc_length: usize,
    /// Radius of the disk the BRIEF tests are drawn from
    pub pattern_radius: f32,
    /// Seed of the BRIEF test pattern
    pub pattern_seed: u64,
    /// Smoothing applied before the binary tests
    pub smoothing: f32,
}

impl Default for FastBrief {
    fn default() -> Self {
        Self {
            max_keypoints: 2000,
            threshold: 0.08,
            arc_length: 9,
            pattern_radius: 12.0,
            pattern_seed: 0xB41E_F000,
            smoothing: 2.0,
        }
    }
}

impl FastBrief {
    fn pattern(&self) -> Vec<[(f32, f32); 2]> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.pattern_seed);
        let radius = self.pattern_radius;
        let mut point = move || loop {
            let x: f32 = rng.gen_range(-radius..=radius);
            let y: f32 = rng.gen_range(-radius..=radius);
            if x * x + y * y <= radius * radius {
                return (x, y);
            }
        };
        (0..BINARY_DESCRIPTOR_BYTES * 8)
            .map(|_| [point(), point()])
            .collect()
    }

    fn margin(&self) -> usize {
        (self.pattern_radius * std::f32::consts::SQRT_2).ceil() as usize + 2
    }

    /// Sum of how far every circle pixel exceeds the threshold, or zero if the segment test fails.
    fn corner_score(&self, image: &GrayFloatImage, x: usize, y: usize) -> f32 {
        let center = image.get(x, y);
        let ring: Vec<f32> = CIRCLE
            .iter()
            .map(|&(dx, dy)| image.get((x as isize + dx) as usize, (y as isize + dy) as usize))
            .collect();
        let brighter = |v: f32| v > center + self.threshold;
        let darker = |v: f32| v < center - self.threshold;
        let has_arc = |test: &dyn Fn(f32) -> bool| {
            let mut run = 0;
            // Walking the ring twice finds runs that wrap around.
            for &v in ring.iter().chain(ring.iter()) {
                if test(v) {
                    run += 1;
                    if run >= self.arc_length {
                        return true;
                    }
                } else {
                    run = 0;
                }
            }
            false
        };
        if !has_arc(&brighter) && !has_arc(&darker) {
            return 0.0;
        }
        ring.iter()
            .map(|&v| ((v - center).abs() - self.threshold).max(0.0))
            .sum()
    }

    fn orientation(&self, smooth: &GrayFloatImage, x: usize, y: usize) -> f32 {
        let radius = self.pattern_radius as isize;
        let (mut m10, mut m01) = (0f32, 0f32);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius * radius {
                    continue;
                }
                let v = smooth.get_clamped(x as isize + dx, y as isize + dy);
                m10 += dx as f32 * v;
                m01 += dy as f32 * v;
            }
        }
        m01.atan2(m10)
    }

    fn describe(
        &self,
        smooth: &GrayFloatImage,
        pattern: &[[(f32, f32); 2]],
        x: usize,
        y: usize,
        angle: f32,
    ) -> BinaryDescriptor {
        let (sin, cos) = angle.sin_cos();
        let steer = |(px, py): (f32, f32)| {
            smooth.sample(
                x as f32 + cos * px - sin * py,
                y as f32 + sin * px + cos * py,
            )
        };
        let mut descriptor = BinaryDescriptor::zeros();
        for (bit, &[a, b]) in pattern.iter().enumerate() {
            if steer(a) < steer(b) {
                descriptor.bytes_mut()[bit / 8] |= 1 << (bit % 8);
            }
        }
        descriptor
    }
}

impl FeatureBackend for FastBrief {
    fn name(&self) -> &str {
        "orb"
    }

    fn config_hash(&self) -> u64 {
        [
            ("max_keypoints", self.max_keypoints.to_string()),
            ("threshold", self.threshold.to_string()),
            ("arc_length", self.arc_length.to_string()),
            ("pattern_radius", self.pattern_radius.to_string()),
            ("pattern_seed", self.pattern_seed.to_string()),
            ("smoothing", self.smoothing.to_string()),
        ]
        .iter()
        .fold(0, |hash, (name, value)| hash_parameter(hash, name, value))
    }

    fn extract(&self, image: ImageId, pixels: &GrayImage) -> Result<KeypointSet, ExtractionError> {
        let margin = self.margin();
        require_size(self.name(), pixels, 2 * margin as u32 + 1)?;
        let float = GrayFloatImage::from_gray(pixels);
        let (width, height) = (float.width(), float.height());

        let mut scores = GrayFloatImage::new(width, height);
        for y in margin..height - margin {
            for x in margin..width - margin {
                scores.put(x, y, self.corner_score(&float, x, y));
            }
        }

        let smooth = gaussian_blur(&float, self.smoothing);
        let pattern = self.pattern();
        let mut set = KeypointSet::new(image, Descriptors::empty_binary());
        for (x, y, score) in local_maxima(&scores, 3, margin, 0.0)
            .into_iter()
            .take(self.max_keypoints)
        {
            let angle = self.orientation(&smooth, x, y);
            let descriptor = self.describe(&smooth, &pattern, x, y, angle);
            set.keypoints.push(
                Keypoint::new(x as f64, y as f64, score)
                    .with_scale(self.pattern_radius)
                    .with_orientation(angle),
            );
            set.descriptors.push_binary(descriptor);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_corners_of_a_square() {
        let pixels = GrayImage::from_fn(80, 80, |x, y| {
            if (30..50).contains(&x) && (30..50).contains(&y) {
                image::Luma([220])
            } else {
                image::Luma([30])
            }
        });
        let set = FastBrief::default().extract(ImageId(0), &pixels).unwrap();
        assert!(set.len() >= 4, "only {} corners", set.len());
        assert_eq!(set.descriptors.len(), set.len());
        for kp in &set.keypoints {
            let near_corner = [(30.0, 30.0), (49.0, 30.0), (30.0, 49.0), (49.0, 49.0)]
                .iter()
                .any(|&(cx, cy)| (kp.point.x - cx).abs() <= 3.0 && (kp.point.y - cy).abs() <= 3.0);
            assert!(near_corner, "unexpected keypoint at {:?}", kp.point);
        }
    }

    #[test]
    fn too_small_is_an_error() {
        let pixels = GrayImage::new(10, 10);
        assert!(matches!(
            FastBrief::default().extract(ImageId(0), &pixels),
            Err(ExtractionError::ImageTooSmall { .. })
        ));
    }
}
