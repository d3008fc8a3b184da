use float_ord::FloatOrd;
use sfm_core::nalgebra::{zero, Matrix4, Point2, Point3, Vector3};
use sfm_core::{CameraToCamera, Pose, WorldToCamera};

/// This is a very quick triangulator to execute, but it is not particularly suitable for optimization.
/// It can be used for optimization when you have very low error to begin with.
/// It is suitable for quickly generating 3d point outputs that are then refined.
/// It is not suitable for accurately computing points at infinity in projective space.
///
/// Reffered to as the Linear-Eigen method by Hartley and Sturm in the paper
/// ["Triangulation"](https://users.cecs.anu.edu.au/~hartley/Papers/triangulation/triangulation.pdf).
///
/// For every observation the bearing `b` of the normalized keypoint is used to build the
/// component of the projection `[R | t]` orthogonal to `b`. The homogeneous point minimizing
/// the sum of squared orthogonal components is the eigenvector of the smallest eigenvalue of a
/// `4x4` symmetric matrix.
///
/// ```
/// use sfm_core::nalgebra::{Point2, Point3, Rotation3, Vector3};
/// use sfm_core::{CameraToCamera, Pose};
/// use sfm_geom::LinearEigenTriangulator;
///
/// let point = Point3::new(0.3, 0.1, 2.0);
/// let pose = CameraToCamera::from_parts(Vector3::new(0.1, 0.1, 0.1), Rotation3::new(Vector3::new(0.1, 0.1, 0.1)));
/// let a = Point2::new(point.x / point.z, point.y / point.z);
/// let moved = pose.transform(point);
/// let b = Point2::new(moved.x / moved.z, moved.y / moved.z);
/// let triangulated = LinearEigenTriangulator::new().triangulate_relative(pose, a, b).unwrap();
/// assert!((point - triangulated).norm() < 1e-6);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct LinearEigenTriangulator {
    epsilon: f64,
    max_iterations: usize,
}

impl LinearEigenTriangulator {
    /// Creates a `LinearEigenTriangulator` with default values.
    ///
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the epsilon used in the symmetric eigen solver.
    ///
    /// Default is `1e-12`.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of iterations for the symmetric eigen solver.
    ///
    /// Default is `1000`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Triangulates a world point from camera poses and the normalized keypoints observed in them.
    ///
    /// Returns `None` with fewer than two observations, for points at infinity, and for points
    /// behind any of the cameras.
    pub fn triangulate_observations(
        &self,
        pairs: impl Iterator<Item = (WorldToCamera, Point2<f64>)> + Clone,
    ) -> Option<Point3<f64>> {
        if pairs.clone().count() < 2 {
            return None;
        }

        let mut a: Matrix4<f64> = zero();
        for (pose, keypoint) in pairs.clone() {
            let bearing = keypoint.to_homogeneous().normalize();
            let pose = pose.projection();
            // Set up the least squares problem.
            let term = pose - bearing * bearing.transpose() * pose;
            a += term.transpose() * term;
        }

        let se = a.try_symmetric_eigen(self.epsilon, self.max_iterations)?;

        // Find the smallest eigenvalue where our point will lie in the null space homogeneous vector.
        let homogeneous = se
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| se.eigenvectors.column(ix).into_owned())?;

        if homogeneous.w.abs() < self.epsilon {
            return None;
        }
        let point = Point3::from(homogeneous.xyz() / homogeneous.w);

        // Ensure the point contains no NaN or infinity.
        if !point.iter().all(|n| n.is_finite()) {
            return None;
        }
        // Ensure the cheirality constraint.
        if pairs.clone().all(|(pose, _)| pose.transform(point).z > 0.0) {
            Some(point)
        } else {
            None
        }
    }

    /// Triangulates a point in the camera space of camera `A` from the relative pose of `B`.
    pub fn triangulate_relative(
        &self,
        pose: CameraToCamera,
        a: Point2<f64>,
        b: Point2<f64>,
    ) -> Option<Point3<f64>> {
        self.triangulate_observations(
            [(WorldToCamera::identity(), a), (WorldToCamera::from(pose), b)]
                .iter()
                .copied(),
        )
    }
}

impl Default for LinearEigenTriangulator {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

/// The angle in radians between the rays from two optical centers to a point.
pub fn triangulation_angle(center_a: Point3<f64>, center_b: Point3<f64>, point: Point3<f64>) -> f64 {
    let ray_a: Vector3<f64> = point - center_a;
    let ray_b: Vector3<f64> = point - center_b;
    let denominator = ray_a.norm() * ray_b.norm();
    if denominator <= 0.0 {
        return 0.0;
    }
    (ray_a.dot(&ray_b) / denominator).clamp(-1.0, 1.0).acos()
}
