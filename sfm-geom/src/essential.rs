use crate::linear::{epipolar_row, sampson_distance, DesignMatrix};
use crate::{LinearEigenTriangulator, NormalizedMatch};
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use sample_consensus::{Estimator, Model};
use sfm_core::nalgebra::{Matrix3, Rotation3, Vector3, SVD};
use sfm_core::{CameraIntrinsics, CameraToCamera, Pose};

/// This stores an essential matrix, which is satisfied by the following constraint:
///
/// transpose(x') * E * x = 0
///
/// Where `x'` and `x` are homogeneous normalized image coordinates of image B and A.
///
/// The essential matrix embodies the epipolar constraint between two calibrated images.
/// For a normalized image coordinate on the virtual image plane at `z = 1.0`, the bearing
/// is `(x, y, 1.0)`. `E * x` is perpendicular to every bearing of image B that lies on the
/// epipolar line of `x`, so its dot product with the matching `x'` is zero.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
pub struct EssentialMatrix(pub Matrix3<f64>);

impl EssentialMatrix {
    /// Builds the essential matrix of two calibrated cameras from the fundamental matrix of
    /// their pixel coordinates.
    pub fn from_fundamental(
        fundamental: &Matrix3<f64>,
        intrinsics_a: &CameraIntrinsics,
        intrinsics_b: &CameraIntrinsics,
    ) -> Self {
        Self(intrinsics_b.matrix().transpose() * fundamental * intrinsics_a.matrix())
    }

    /// Can be used to enforce the constraints of an essential matrix to fix it.
    ///
    /// This finds the closest essential matrix in frobenius form. This just means
    /// that the two singular values are averaged and the null singular value is
    /// forced to zero.
    pub fn recondition(self, epsilon: f64, max_iterations: usize) -> Option<Self> {
        let mut svd = self.0.try_svd(true, true, epsilon, max_iterations)?;
        // Now that the singular values are sorted, find the closest
        // essential matrix to E in frobenius form.
        svd.singular_values[2] = 0.0;
        let new_singular = (svd.singular_values[0] + svd.singular_values[1]) / 2.0;
        svd.singular_values[0] = new_singular;
        svd.singular_values[1] = new_singular;
        let mat = svd.recompose().ok()?;
        Some(Self(mat))
    }

    /// Returns two possible rotations for the essential matrix along with a translation
    /// bearing of arbitrary length. The translation's length is unknown and of unknown sign
    /// and must be solved for by using a prior, such as the cheirality of triangulated points.
    ///
    /// `epsilon` is the threshold by which the singular value decomposition is considered
    /// complete. It is recommended to set this to no higher than `1e-6`.
    ///
    /// `max_iterations` is the maximum number of iterations that singular value decomposition
    /// will run on this matrix.
    pub fn possible_rotations_unscaled_translation(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<(Rotation3<f64>, Rotation3<f64>, Vector3<f64>)> {
        let Self(essential) = *self;

        // `W` from https://en.wikipedia.org/wiki/Essential_matrix#Finding_one_solution.
        let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let wt = w.transpose();

        let svd = SVD::try_new(essential, true, true, epsilon, max_iterations)?;
        let (mut u, mut v_t) = (svd.u?, svd.v_t?);
        // Force the determinants to be positive. This is done to ensure the
        // handedness of the rotation matrix is correct.
        // Last column of U is undetermined since d = (a a 0).
        if u.determinant() < 0.0 {
            for n in u.column_mut(2).iter_mut() {
                *n *= -1.0;
            }
        }
        // Last row of Vt is undetermined since d = (a a 0).
        if v_t.determinant() < 0.0 {
            for n in v_t.row_mut(2).iter_mut() {
                *n *= -1.0;
            }
        }
        Some((
            Rotation3::from_matrix_unchecked(u * w * v_t),
            Rotation3::from_matrix_unchecked(u * wt * v_t),
            u.column(2).into_owned(),
        ))
    }

    /// The four relative poses compatible with the essential matrix. Exactly one of them puts
    /// the observed points in front of both cameras.
    pub fn possible_unscaled_poses(
        &self,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<[CameraToCamera; 4]> {
        self.possible_rotations_unscaled_translation(epsilon, max_iterations)
            .map(|(rot_a, rot_b, t)| {
                [
                    CameraToCamera::from_parts(t, rot_a),
                    CameraToCamera::from_parts(t, rot_b),
                    CameraToCamera::from_parts(-t, rot_a),
                    CameraToCamera::from_parts(-t, rot_b),
                ]
            })
    }

    /// Picks the pose which places the most matches in front of both cameras.
    ///
    /// Returns the pose with a unit length translation and the number of matches that passed
    /// the cheirality test, or `None` if no pose passes for any match.
    pub fn solve_pose(
        &self,
        matches: impl Iterator<Item = NormalizedMatch> + Clone,
        triangulator: &LinearEigenTriangulator,
        epsilon: f64,
        max_iterations: usize,
    ) -> Option<(CameraToCamera, usize)> {
        let poses = self.possible_unscaled_poses(epsilon, max_iterations)?;
        poses
            .iter()
            .map(|&pose| {
                let passing = matches
                    .clone()
                    .filter(|&NormalizedMatch(a, b)| {
                        triangulator.triangulate_relative(pose, a, b).is_some()
                    })
                    .count();
                (pose, passing)
            })
            // Ties resolve to the earliest pose to stay deterministic.
            .fold(None, |best: Option<(CameraToCamera, usize)>, candidate| match best {
                Some(best) if best.1 >= candidate.1 => Some(best),
                _ => Some(candidate),
            })
            .filter(|&(_, passing)| passing > 0)
    }
}

impl Model<NormalizedMatch> for EssentialMatrix {
    /// Sampson distance in normalized image units.
    fn residual(&self, data: &NormalizedMatch) -> f64 {
        sampson_distance(&self.0, data.0, data.1)
    }
}

/// Performs the
/// [eight-point algorithm](https://en.wikipedia.org/wiki/Eight-point_algorithm)
/// by Richard Hartley and Andrew Zisserman on normalized image coordinates.
///
/// The estimate is reconditioned with [`EssentialMatrix::recondition`].
#[derive(Copy, Clone, Debug)]
pub struct EightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl EightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<EssentialMatrix>
    where
        I: Iterator<Item = NormalizedMatch> + Clone,
    {
        let mut design = DesignMatrix::new(9);
        for NormalizedMatch(a, b) in data {
            design.push(&epipolar_row(a, b));
        }
        if design.rows() < 8 {
            return None;
        }
        let null = design.null_vector(self.epsilon, self.iterations)?;
        let mat = Matrix3::from_row_slice(null.as_slice());
        EssentialMatrix(mat).recondition(self.epsilon, self.iterations)
    }
}

impl Default for EightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<NormalizedMatch> for EightPoint {
    type Model = EssentialMatrix;
    type ModelIter = Option<EssentialMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = NormalizedMatch> + Clone,
    {
        self.from_matches(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::nalgebra::{IsometryMatrix3, Point2, Point3};

    fn skew(v: Vector3<f64>) -> Matrix3<f64> {
        Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
    }

    #[test]
    fn one_of_the_poses_is_correct() {
        let pose = CameraToCamera(IsometryMatrix3::from_parts(
            Vector3::new(-0.8, 0.4, 0.5).into(),
            Rotation3::from_euler_angles(0.2, 0.3, 0.4),
        ));
        let essential = EssentialMatrix(skew(pose.0.translation.vector) * pose.0.rotation.matrix());
        let rbs = essential.possible_unscaled_poses(1e-6, 50).unwrap();
        let one_correct = rbs.iter().any(|&upose| {
            let angle_residual = upose.0.rotation.rotation_to(&pose.0.rotation).angle();
            let translation_residual = 1.0
                - upose
                    .0
                    .translation
                    .vector
                    .normalize()
                    .dot(&pose.0.translation.vector.normalize());
            angle_residual < 1e-4 && translation_residual < 1e-4
        });
        assert!(one_correct);
    }

    #[test]
    fn cheirality_selects_true_pose() {
        let pose = CameraToCamera::from_parts(
            Vector3::new(-0.5, 0.1, 0.05),
            Rotation3::from_euler_angles(0.05, -0.1, 0.02),
        );
        let essential = EssentialMatrix(skew(pose.0.translation.vector) * pose.0.rotation.matrix());
        let matches: Vec<NormalizedMatch> = (0..20)
            .map(|i| {
                let f = i as f64;
                let p = Point3::new((f * 0.37).sin(), (f * 0.71).cos() * 0.5, 4.0 + (f * 0.13).sin());
                let q = pose.transform(p);
                NormalizedMatch(Point2::new(p.x / p.z, p.y / p.z), Point2::new(q.x / q.z, q.y / q.z))
            })
            .collect();
        let (solved, passing) = essential
            .solve_pose(matches.iter().copied(), &LinearEigenTriangulator::new(), 1e-9, 100)
            .unwrap();
        assert_eq!(passing, matches.len());
        assert!(solved.0.rotation.rotation_to(&pose.0.rotation).angle() < 1e-6);
        let direction = solved.0.translation.vector.dot(&pose.0.translation.vector.normalize());
        assert!(direction > 0.999);
    }
}
