use crate::KeyPoint;
use nalgebra::{Matrix3, Point2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics without distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    /// The focal length multiplier applied to the largest image side when nothing is known
    /// about the camera.
    pub const DEFAULT_FOCAL_FACTOR: f64 = 1.2;

    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// A guess of the intrinsics for an image of the given dimensions.
    pub fn estimated(width: u32, height: u32) -> Self {
        let focal = Self::DEFAULT_FOCAL_FACTOR * f64::from(width.max(height));
        Self {
            fx: focal,
            fy: focal,
            cx: 0.5 * f64::from(width),
            cy: 0.5 * f64::from(height),
        }
    }

    /// The mean focal length, used to convert pixel thresholds to normalized ones.
    pub fn focal(&self) -> f64 {
        0.5 * (self.fx + self.fy)
    }

    /// Converts a pixel keypoint into normalized image coordinates.
    pub fn calibrate(&self, keypoint: KeyPoint) -> Point2<f64> {
        Point2::new(
            (keypoint.x - self.cx) / self.fx,
            (keypoint.y - self.cy) / self.fy,
        )
    }

    /// Converts normalized image coordinates into a pixel keypoint.
    pub fn uncalibrate(&self, point: Point2<f64>) -> KeyPoint {
        KeyPoint(Point2::new(
            point.x * self.fx + self.cx,
            point.y * self.fy + self.cy,
        ))
    }

    /// The matrix mapping homogeneous normalized coordinates to homogeneous pixel coordinates.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }
}

/// Static information about one image of a scene. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ImageInfo {
    pub id: crate::ImageId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Intrinsics supplied with the dataset, if any.
    pub known_intrinsics: Option<CameraIntrinsics>,
}

impl ImageInfo {
    /// The intrinsics to use for this image: the known ones or an estimate from its size.
    pub fn intrinsics(&self) -> CameraIntrinsics {
        self.known_intrinsics
            .unwrap_or_else(|| CameraIntrinsics::estimated(self.width, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn calibrate_uncalibrate() {
        let intrinsics = CameraIntrinsics::new(800.0, 790.0, 320.0, 240.0);
        let keypoint = KeyPoint(Point2::new(100.5, 377.25));
        let back = intrinsics.uncalibrate(intrinsics.calibrate(keypoint));
        assert_relative_eq!(keypoint.0, back.0, epsilon = 1e-9);
    }

    #[test]
    fn estimated_uses_largest_side() {
        let intrinsics = CameraIntrinsics::estimated(640, 480);
        assert_relative_eq!(intrinsics.fx, 768.0);
        assert_relative_eq!(intrinsics.cy, 240.0);
    }
}
