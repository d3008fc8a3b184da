use derive_more::{AsMut, AsRef, From, Into};
use nalgebra::{IsometryMatrix3, Matrix3x4, Point2, Point3, Rotation3, Vector3, Vector6};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This trait is implemented by the poses in this library:
///
/// * [`WorldToCamera`] - Transforms world points into camera points
/// * [`CameraToCamera`] - Transforms camera points from one camera into another camera
pub trait Pose: From<IsometryMatrix3<f64>> + Clone + Copy {
    /// Retrieve the isometry.
    fn isometry(self) -> IsometryMatrix3<f64>;

    /// Creates a pose with no change in position or orientation.
    fn identity() -> Self {
        IsometryMatrix3::identity().into()
    }

    /// Create the pose from rotation and translation.
    fn from_parts(translation: Vector3<f64>, rotation: Rotation3<f64>) -> Self {
        IsometryMatrix3::from_parts(translation.into(), rotation).into()
    }

    /// Applies a scale factor to the pose (scales the translation component)
    #[must_use]
    fn scale(self, scale: f64) -> Self {
        let mut isometry = self.isometry();
        isometry.translation.vector *= scale;
        isometry.into()
    }

    /// Retrieve the pose as a `3x4` projection matrix `[R | t]`.
    fn projection(self) -> Matrix3x4<f64> {
        let isometry = self.isometry();
        let rot = isometry.rotation.matrix();
        let trans = isometry.translation.vector;
        Matrix3x4::from_columns(&[rot.column(0), rot.column(1), rot.column(2), trans.column(0)])
    }

    /// Transform a point by the pose.
    fn transform(self, point: Point3<f64>) -> Point3<f64> {
        self.isometry() * point
    }

    /// Applies a small motion `delta` on the left of the pose.
    ///
    /// The first three components are a translation and the last three a rotation vector, so the
    /// output point moves by `delta.xyz() - skew(output) * rotation` to first order.
    #[must_use]
    fn retract(self, delta: Vector6<f64>) -> Self {
        let isometry = self.isometry();
        let rotation = Rotation3::new(Vector3::new(delta[3], delta[4], delta[5]));
        let translation = rotation * isometry.translation.vector + delta.xyz();
        Self::from_parts(translation, rotation * isometry.rotation)
    }
}

/// This contains a world pose, which is a pose of the world relative to the camera.
/// This maps world points into camera points, changing an absolute position into
/// a vector relative to the camera.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct WorldToCamera(pub IsometryMatrix3<f64>);

impl Pose for WorldToCamera {
    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl WorldToCamera {
    /// The location of the optical center in world space.
    pub fn optical_center(self) -> Point3<f64> {
        self.0.inverse() * Point3::origin()
    }

    /// Projects a world point into normalized image coordinates.
    ///
    /// Returns `None` when the point is not in front of the camera.
    pub fn project(self, point: Point3<f64>) -> Option<Point2<f64>> {
        let camera = self.transform(point);
        if camera.z > 0.0 && camera.z.is_finite() {
            Some(Point2::new(camera.x / camera.z, camera.y / camera.z))
        } else {
            None
        }
    }

    /// The viewing direction of the camera in world space.
    pub fn forward(self) -> Vector3<f64> {
        self.0.rotation.inverse() * Vector3::z()
    }

    /// The up direction of the camera in world space (camera `y` points down).
    pub fn up(self) -> Vector3<f64> {
        self.0.rotation.inverse() * -Vector3::y()
    }
}

/// This contains a relative pose that transforms the camera points of one image
/// into the corresponding camera points of another image. This transforms
/// the point from the camera space of camera `A` to camera `B`.
///
/// Camera space for a given camera is defined as thus:
///
/// * Origin is the optical center
/// * Positive z axis is forwards
/// * Positive y axis is down
/// * Positive x axis is right
///
/// Note that this is a right-handed coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, AsMut, AsRef, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraToCamera(pub IsometryMatrix3<f64>);

impl Pose for CameraToCamera {
    #[inline(always)]
    fn isometry(self) -> IsometryMatrix3<f64> {
        self.into()
    }
}

impl From<CameraToCamera> for WorldToCamera {
    /// Interprets the first camera of the relative pose as the world frame.
    fn from(pose: CameraToCamera) -> Self {
        Self(pose.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn retract_zero_is_identity() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(0.1, -0.3, 2.0),
            Rotation3::from_euler_angles(0.1, 0.2, 0.3),
        );
        let same = pose.retract(Vector6::zeros());
        assert_relative_eq!(pose.0, same.0, epsilon = 1e-12);
    }

    #[test]
    fn projects_in_front_only() {
        let pose = WorldToCamera::identity();
        assert!(pose.project(Point3::new(0.0, 0.0, -1.0)).is_none());
        let p = pose.project(Point3::new(1.0, 2.0, 4.0)).unwrap();
        assert_relative_eq!(p, Point2::new(0.25, 0.5));
    }

    #[test]
    fn optical_center_maps_to_origin() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(1.0, 2.0, 3.0),
            Rotation3::from_euler_angles(0.3, -0.1, 0.7),
        );
        let center = pose.optical_center();
        assert_relative_eq!(pose.transform(center), Point3::origin(), epsilon = 1e-12);
    }
}
