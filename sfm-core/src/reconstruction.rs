use crate::{CameraIntrinsics, ImageId, ImageInfo, KeyPoint, TrackId, WorldToCamera};
use nalgebra::Point3;
use std::collections::BTreeMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A camera that has been registered into the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RegisteredCamera {
    pub pose: WorldToCamera,
    pub intrinsics: CameraIntrinsics,
}

impl RegisteredCamera {
    /// Reprojection error in pixels of `point` against the observed `pixel`.
    ///
    /// Points behind the camera have an infinite error.
    pub fn reprojection_error(&self, point: Point3<f64>, pixel: KeyPoint) -> f64 {
        self.pose
            .project(point)
            .map(|p| (self.intrinsics.uncalibrate(p).0 - pixel.0).norm())
            .unwrap_or(f64::INFINITY)
    }
}

/// One image observation of a triangulated point.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PointObservation {
    pub image: ImageId,
    /// Index into the fused keypoint list of the image.
    pub keypoint: u32,
    pub pixel: KeyPoint,
}

/// A triangulated track.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Point3D {
    pub position: Point3<f64>,
    /// Mean reprojection error in pixels over all observations.
    pub error: f64,
    pub observations: Vec<PointObservation>,
}

/// Final status of an image in the reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum ImageStatus {
    Registered,
    Unregistered { reason: String },
}

/// Camera poses and 3d points of one scene.
///
/// Every image of the scene has a status, so images that could not be registered are still
/// present in the output. Once registered, an image stays registered.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Reconstruction {
    pub images: Vec<ImageInfo>,
    pub status: BTreeMap<ImageId, ImageStatus>,
    pub cameras: BTreeMap<ImageId, RegisteredCamera>,
    pub points: BTreeMap<TrackId, Point3D>,
}

impl Reconstruction {
    pub fn new(images: Vec<ImageInfo>) -> Self {
        let status = images
            .iter()
            .map(|info| {
                (
                    info.id,
                    ImageStatus::Unregistered {
                        reason: "registration not attempted".to_string(),
                    },
                )
            })
            .collect();
        Self {
            images,
            status,
            cameras: BTreeMap::new(),
            points: BTreeMap::new(),
        }
    }

    pub fn image(&self, image: ImageId) -> Option<&ImageInfo> {
        self.images.get(image.index()).filter(|info| info.id == image)
    }

    /// Adds a camera. Returns `false` if the image was already registered, in which case
    /// nothing changes.
    pub fn register(&mut self, image: ImageId, camera: RegisteredCamera) -> bool {
        if self.cameras.contains_key(&image) {
            return false;
        }
        self.cameras.insert(image, camera);
        self.status.insert(image, ImageStatus::Registered);
        true
    }

    /// Records why an image is not registered. Has no effect on registered images.
    pub fn mark_unregistered(&mut self, image: ImageId, reason: impl Into<String>) {
        if !self.cameras.contains_key(&image) {
            self.status.insert(
                image,
                ImageStatus::Unregistered {
                    reason: reason.into(),
                },
            );
        }
    }

    pub fn is_registered(&self, image: ImageId) -> bool {
        self.cameras.contains_key(&image)
    }

    pub fn registered_count(&self) -> usize {
        self.cameras.len()
    }

    /// Images that are not registered along with the recorded reason.
    pub fn unregistered(&self) -> impl Iterator<Item = (ImageId, &str)> + '_ {
        self.status.iter().filter_map(|(&image, status)| match status {
            ImageStatus::Registered => None,
            ImageStatus::Unregistered { reason } => Some((image, reason.as_str())),
        })
    }

    /// Computes the mean reprojection error of a point against the registered cameras.
    pub fn point_error(&self, point: &Point3D) -> f64 {
        let errors = point.observations.iter().filter_map(|obs| {
            self.cameras
                .get(&obs.image)
                .map(|camera| camera.reprojection_error(point.position, obs.pixel))
        });
        let (sum, count) = errors.fold((0.0, 0usize), |(s, c), e| (s + e, c + 1));
        if count == 0 {
            f64::INFINITY
        } else {
            sum / count as f64
        }
    }

    /// Recomputes the stored error of every point.
    pub fn update_point_errors(&mut self) {
        let errors: Vec<(TrackId, f64)> = self
            .points
            .iter()
            .map(|(&track, point)| (track, self.point_error(point)))
            .collect();
        for (track, error) in errors {
            if let Some(point) = self.points.get_mut(&track) {
                point.error = error;
            }
        }
    }

    /// Mean reprojection error over every observation of every point.
    pub fn mean_reprojection_error(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for point in self.points.values() {
            for obs in &point.observations {
                if let Some(camera) = self.cameras.get(&obs.image) {
                    sum += camera.reprojection_error(point.position, obs.pixel);
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    pub fn observation_count(&self) -> usize {
        self.points.values().map(|p| p.observations.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pose;

    fn info(id: u32) -> ImageInfo {
        ImageInfo {
            id: ImageId(id),
            name: format!("{:03}.png", id),
            width: 64,
            height: 48,
            known_intrinsics: None,
        }
    }

    #[test]
    fn registration_is_monotonic() {
        let mut reconstruction = Reconstruction::new(vec![info(0), info(1)]);
        let camera = RegisteredCamera {
            pose: WorldToCamera::identity(),
            intrinsics: CameraIntrinsics::estimated(64, 48),
        };
        assert!(reconstruction.register(ImageId(0), camera));
        assert!(!reconstruction.register(ImageId(0), camera));
        reconstruction.mark_unregistered(ImageId(0), "should be ignored");
        assert_eq!(
            reconstruction.status[&ImageId(0)],
            ImageStatus::Registered
        );
        assert_eq!(reconstruction.unregistered().count(), 1);
    }
}
