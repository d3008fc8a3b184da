use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, MinimizationReport};
use log::*;
use sfm_core::nalgebra::{
    storage::Owned, DVector, Dynamic, Matrix2x3, Matrix3, Matrix3x6, OMatrix, Point3, VecStorage,
    Vector2, Vector3, Vector6, U1, U3, U6,
};
use sfm_core::{
    CameraIntrinsics, ImageId, KeyPoint, Pose, Reconstruction, RegisteredCamera, TrackId,
    WorldToCamera,
};
use std::collections::{BTreeMap, BTreeSet};

/// Refinement of camera poses and points on pixel reprojection error.
///
/// Every solve is a [`LeastSquaresProblem`] handed to [`LevenbergMarquardt`]. Residuals larger
/// than `loss_cutoff` pixels are scaled so that half their squared norm is the Huber loss, so a
/// few bad observations cannot drag the solution.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BundleAdjuster {
    patience: usize,
    loss: Huber,
}

impl Default for BundleAdjuster {
    fn default() -> Self {
        Self {
            patience: 20,
            loss: Huber(2.0),
        }
    }
}

/// Which parts of a reconstruction bundle adjustment may change.
#[derive(Clone, Debug, Default)]
pub struct BundleAdjustScope<'a> {
    /// Cameras that stay where they are. Fixing at least one removes the gauge freedom.
    pub fixed_cameras: Option<&'a BTreeSet<ImageId>>,
    /// Only these points and the cameras observing them are optimized when set.
    pub tracks: Option<&'a BTreeSet<TrackId>>,
}

impl BundleAdjuster {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the patience of one solve. The residuals are evaluated at most
    /// `patience * (parameters + 1)` times.
    ///
    /// Default is `20`.
    #[must_use]
    pub fn iterations(self, patience: usize) -> Self {
        Self {
            patience: patience.max(1),
            ..self
        }
    }

    /// Set the residual in pixels above which the loss becomes linear.
    ///
    /// Default is `2.0`.
    #[must_use]
    pub fn loss_cutoff(self, loss_cutoff: f64) -> Self {
        Self {
            loss: Huber(loss_cutoff),
            ..self
        }
    }

    /// Refines the pose of one camera against fixed world points.
    ///
    /// The input pose is returned when the solver does not improve on it.
    pub fn refine_pose(
        &self,
        camera: RegisteredCamera,
        observations: &[(Point3<f64>, KeyPoint)],
    ) -> WorldToCamera {
        if observations.len() < 3 {
            return camera.pose;
        }
        let problem = PoseProblem {
            base: camera.pose,
            delta: Vector6::zeros(),
            intrinsics: camera.intrinsics,
            observations,
            loss: self.loss,
        };
        let initial = problem.residuals();
        let (solved, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .minimize(problem);
        if self.accept(initial, &report) {
            solved.pose()
        } else {
            camera.pose
        }
    }

    /// Refines one world point against fixed cameras.
    pub fn refine_point(
        &self,
        point: Point3<f64>,
        observations: &[(RegisteredCamera, KeyPoint)],
    ) -> Point3<f64> {
        if observations.len() < 2 {
            return point;
        }
        let problem = PointProblem {
            point,
            observations,
            loss: self.loss,
        };
        let initial = problem.residuals();
        let (solved, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .minimize(problem);
        if self.accept(initial, &report) {
            solved.point
        } else {
            point
        }
    }

    /// Whether to keep the answer of the solver: only when the objective went down.
    fn accept(&self, initial: Option<DVector<f64>>, report: &MinimizationReport<f64>) -> bool {
        let initial = initial.map_or(f64::INFINITY, |residuals| 0.5 * residuals.norm_squared());
        trace!(
            "levenberg-marquardt {:?} after {} evaluations, objective {} -> {}",
            report.termination,
            report.number_of_evaluations,
            initial,
            report.objective_function
        );
        report.objective_function.is_finite() && report.objective_function <= initial
    }

    /// Bundle adjustment by block coordinate descent: each round refines every point with the
    /// cameras held fixed, then every camera with the points held fixed.
    ///
    /// Point errors are updated afterwards.
    pub fn bundle_adjust(
        &self,
        reconstruction: &mut Reconstruction,
        rounds: usize,
        scope: BundleAdjustScope<'_>,
    ) {
        let in_scope = |track: &TrackId| scope.tracks.map_or(true, |tracks| tracks.contains(track));
        let before = reconstruction.mean_reprojection_error();
        for _ in 0..rounds {
            let cameras = &reconstruction.cameras;
            for (_, point) in reconstruction
                .points
                .iter_mut()
                .filter(|(track, _)| in_scope(*track))
            {
                let observations: Vec<(RegisteredCamera, KeyPoint)> = point
                    .observations
                    .iter()
                    .filter_map(|obs| cameras.get(&obs.image).map(|&camera| (camera, obs.pixel)))
                    .collect();
                point.position = self.refine_point(point.position, &observations);
            }

            let mut per_camera: BTreeMap<ImageId, Vec<(Point3<f64>, KeyPoint)>> = BTreeMap::new();
            for (_, point) in reconstruction
                .points
                .iter()
                .filter(|(track, _)| in_scope(*track))
            {
                for obs in &point.observations {
                    per_camera
                        .entry(obs.image)
                        .or_default()
                        .push((point.position, obs.pixel));
                }
            }
            for (image, camera) in reconstruction.cameras.iter_mut() {
                if scope
                    .fixed_cameras
                    .map_or(false, |fixed| fixed.contains(image))
                {
                    continue;
                }
                if let Some(observations) = per_camera.get(image) {
                    if observations.len() >= 6 {
                        camera.pose = self.refine_pose(*camera, observations);
                    }
                }
            }
        }
        reconstruction.update_point_errors();
        debug!(
            "bundle adjustment over {} rounds took mean reprojection error from {} to {}",
            rounds,
            before,
            reconstruction.mean_reprojection_error()
        );
    }
}

/// The Huber loss with the given cutoff in pixels.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Huber(f64);

impl Huber {
    /// The factor applied to a residual of length `norm` so that half its squared length is the
    /// Huber loss of `norm`.
    fn scale(self, norm: f64) -> f64 {
        if norm <= self.0 {
            1.0
        } else {
            (self.0 * (2.0 * norm - self.0)).sqrt() / norm
        }
    }

    /// The residual of a point behind the camera.
    fn behind(self) -> Vector2<f64> {
        Vector2::new(10.0 * self.0, 0.0)
    }

    /// The scaled residual of one observation along with the Jacobian of the pixel with respect
    /// to the camera point, scaled the same way.
    fn observe(
        self,
        intrinsics: &CameraIntrinsics,
        camera_point: Point3<f64>,
        pixel: KeyPoint,
    ) -> (Vector2<f64>, Option<Matrix2x3<f64>>) {
        match projection_jacobian(intrinsics, camera_point) {
            Some((projected, jacobian)) => {
                let residual = projected - pixel.0.coords;
                let scale = self.scale(residual.norm());
                (scale * residual, Some(scale * jacobian))
            }
            None => (self.behind(), None),
        }
    }
}

/// The pose of one camera as a left motion `delta` of a starting pose.
#[derive(Clone)]
struct PoseProblem<'a> {
    base: WorldToCamera,
    delta: Vector6<f64>,
    intrinsics: CameraIntrinsics,
    observations: &'a [(Point3<f64>, KeyPoint)],
    loss: Huber,
}

impl PoseProblem<'_> {
    fn pose(&self) -> WorldToCamera {
        self.base.retract(self.delta)
    }
}

impl LeastSquaresProblem<f64, Dynamic, U6> for PoseProblem<'_> {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, U6>;
    type ParameterStorage = Owned<f64, U6>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.delta = *x;
    }

    fn params(&self) -> Vector6<f64> {
        self.delta
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let pose = self.pose();
        Some(DVector::from_iterator(
            2 * self.observations.len(),
            self.observations.iter().flat_map(|&(world, pixel)| {
                let (residual, _) = self.loss.observe(&self.intrinsics, pose.transform(world), pixel);
                [residual.x, residual.y]
            }),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dynamic, U6>> {
        let pose = self.pose();
        let mut jacobian = OMatrix::<f64, Dynamic, U6>::zeros(2 * self.observations.len());
        for (ix, &(world, pixel)) in self.observations.iter().enumerate() {
            let camera_point = pose.transform(world);
            if let (_, Some(jp)) = self.loss.observe(&self.intrinsics, camera_point, pixel) {
                // First order motion of the camera point under a left motion of the pose.
                let mut dxc = Matrix3x6::zeros();
                dxc.fixed_columns_mut::<3>(0).copy_from(&Matrix3::identity());
                dxc.fixed_columns_mut::<3>(3)
                    .copy_from(&-skew(camera_point.coords));
                jacobian
                    .fixed_rows_mut::<2>(2 * ix)
                    .copy_from(&(jp * dxc));
            }
        }
        Some(jacobian)
    }
}

#[derive(Clone)]
struct PointProblem<'a> {
    point: Point3<f64>,
    observations: &'a [(RegisteredCamera, KeyPoint)],
    loss: Huber,
}

impl LeastSquaresProblem<f64, Dynamic, U3> for PointProblem<'_> {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, x: &Vector3<f64>) {
        self.point = Point3::from(*x);
    }

    fn params(&self) -> Vector3<f64> {
        self.point.coords
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(DVector::from_iterator(
            2 * self.observations.len(),
            self.observations.iter().flat_map(|&(camera, pixel)| {
                let camera_point = camera.pose.transform(self.point);
                let (residual, _) = self.loss.observe(&camera.intrinsics, camera_point, pixel);
                [residual.x, residual.y]
            }),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dynamic, U3>> {
        let mut jacobian = OMatrix::<f64, Dynamic, U3>::zeros(2 * self.observations.len());
        for (ix, &(camera, pixel)) in self.observations.iter().enumerate() {
            let camera_point = camera.pose.transform(self.point);
            if let (_, Some(jp)) = self.loss.observe(&camera.intrinsics, camera_point, pixel) {
                jacobian
                    .fixed_rows_mut::<2>(2 * ix)
                    .copy_from(&(jp * camera.pose.0.rotation.matrix()));
            }
        }
        Some(jacobian)
    }
}

/// Projects a camera point into pixels and returns the Jacobian of the pixel with respect to
/// the camera point. Returns `None` for points that are not in front of the camera.
fn projection_jacobian(
    intrinsics: &CameraIntrinsics,
    camera_point: Point3<f64>,
) -> Option<(Vector2<f64>, Matrix2x3<f64>)> {
    let Point3 { coords: p, .. } = camera_point;
    if p.z <= 1e-9 || !p.z.is_finite() {
        return None;
    }
    let inv_z = 1.0 / p.z;
    let projected = Vector2::new(
        intrinsics.fx * p.x * inv_z + intrinsics.cx,
        intrinsics.fy * p.y * inv_z + intrinsics.cy,
    );
    let jacobian = Matrix2x3::new(
        intrinsics.fx * inv_z,
        0.0,
        -intrinsics.fx * p.x * inv_z * inv_z,
        0.0,
        intrinsics.fy * inv_z,
        -intrinsics.fy * p.y * inv_z * inv_z,
    );
    Some((projected, jacobian))
}

fn skew(v: Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::nalgebra::{Point2, Rotation3};
    use sfm_core::{ImageInfo, PointObservation, Point3D};

    fn camera() -> RegisteredCamera {
        RegisteredCamera {
            pose: WorldToCamera::from_parts(
                Vector3::new(0.2, -0.1, 0.3),
                Rotation3::from_euler_angles(0.05, -0.02, 0.1),
            ),
            intrinsics: CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0),
        }
    }

    fn pixel(camera: &RegisteredCamera, point: Point3<f64>) -> KeyPoint {
        camera
            .intrinsics
            .uncalibrate(camera.pose.project(point).unwrap_or_else(Point2::origin))
    }

    fn points(count: usize) -> Vec<Point3<f64>> {
        (0..count)
            .map(|i| {
                let f = i as f64;
                Point3::new((f * 0.9).sin() * 2.0, (f * 0.4).cos(), 5.0 + (f * 0.3).sin())
            })
            .collect()
    }

    #[test]
    fn huber_scale_matches_the_loss() {
        let loss = Huber(2.0);
        for &norm in &[0.5, 2.0, 3.0, 40.0] {
            let scaled = loss.scale(norm) * norm;
            let huber = if norm <= 2.0 {
                0.5 * norm * norm
            } else {
                2.0 * (norm - 1.0)
            };
            assert!((0.5 * scaled * scaled - huber).abs() < 1e-9);
        }
    }

    #[test]
    fn pose_converges_from_perturbation() {
        let truth = camera();
        let observations: Vec<(Point3<f64>, KeyPoint)> =
            points(30).into_iter().map(|p| (p, pixel(&truth, p))).collect();
        let start = RegisteredCamera {
            pose: truth
                .pose
                .retract(Vector6::new(0.05, -0.03, 0.02, 0.01, -0.02, 0.015)),
            ..truth
        };
        let refined = BundleAdjuster::new()
            .iterations(50)
            .refine_pose(start, &observations);
        let error = refined.0.translation.vector - truth.pose.0.translation.vector;
        assert!(error.norm() < 1e-6, "translation error {}", error.norm());
        assert!(refined.0.rotation.rotation_to(&truth.pose.0.rotation).angle() < 1e-6);
    }

    #[test]
    fn point_converges_from_perturbation() {
        let a = camera();
        let b = RegisteredCamera {
            pose: WorldToCamera::from_parts(Vector3::new(-0.5, 0.0, 0.1), Rotation3::identity()),
            ..a
        };
        let truth = Point3::new(0.3, -0.2, 4.0);
        let observations = [(a, pixel(&a, truth)), (b, pixel(&b, truth))];
        let refined = BundleAdjuster::new()
            .iterations(50)
            .refine_point(truth + Vector3::new(0.1, -0.1, 0.3), &observations);
        assert!((refined - truth).norm() < 1e-6);
    }

    #[test]
    fn bundle_adjustment_reduces_error() {
        let cameras: Vec<RegisteredCamera> = (0..3)
            .map(|ix| RegisteredCamera {
                pose: WorldToCamera::from_parts(
                    Vector3::new(0.4 * ix as f64, 0.0, 0.0),
                    Rotation3::from_euler_angles(0.0, -0.05 * ix as f64, 0.0),
                ),
                ..camera()
            })
            .collect();
        let images = (0..3)
            .map(|ix| ImageInfo {
                id: ImageId(ix),
                name: format!("{}.png", ix),
                width: 640,
                height: 480,
                known_intrinsics: None,
            })
            .collect();
        let mut reconstruction = Reconstruction::new(images);
        for (ix, &camera) in cameras.iter().enumerate() {
            reconstruction.register(ImageId(ix as u32), camera);
        }
        for (ix, truth) in points(40).into_iter().enumerate() {
            let observations = cameras
                .iter()
                .enumerate()
                .map(|(image, camera)| PointObservation {
                    image: ImageId(image as u32),
                    keypoint: ix as u32,
                    pixel: pixel(camera, truth),
                })
                .collect();
            let offset = Vector3::new(0.02, -0.03, 0.05) * ((ix % 3) as f64 - 1.0);
            reconstruction.points.insert(
                TrackId(ix as u32),
                Point3D {
                    position: truth + offset,
                    error: 0.0,
                    observations,
                },
            );
        }
        let before = reconstruction.mean_reprojection_error();
        let fixed: BTreeSet<ImageId> = [ImageId(0)].into_iter().collect();
        BundleAdjuster::new().bundle_adjust(
            &mut reconstruction,
            3,
            BundleAdjustScope {
                fixed_cameras: Some(&fixed),
                tracks: None,
            },
        );
        let after = reconstruction.mean_reprojection_error();
        assert!(after < 0.1 * before, "error went from {} to {}", before, after);
        assert_eq!(reconstruction.cameras[&ImageId(0)], cameras[0]);
    }
}
