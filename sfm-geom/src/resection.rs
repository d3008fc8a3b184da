use crate::linear::DesignMatrix;
use crate::WorldMatch;
use sample_consensus::{Estimator, Model};
use sfm_core::nalgebra::{Matrix3, Matrix3x4, Matrix4, Point3, Rotation3, SVD};
use sfm_core::{Pose, WorldToCamera};

/// Residual given to points behind the camera so they are never counted as inliers.
const BEHIND_CAMERA_RESIDUAL: f64 = 1e6;

impl Model<WorldMatch> for WorldToCamera {
    /// Reprojection error in normalized image units.
    fn residual(&self, data: &WorldMatch) -> f64 {
        let &WorldMatch(keypoint, world) = data;
        self.project(world)
            .map(|projected| (projected - keypoint).norm())
            .unwrap_or(BEHIND_CAMERA_RESIDUAL)
    }
}

/// Camera resection with the direct linear transform from six or more matches between
/// normalized keypoints and world points.
///
/// The world points are centered and scaled before solving. The projection matrix is then
/// projected onto the closest rotation and the scale removed from the translation.
#[derive(Copy, Clone, Debug)]
pub struct DltResection {
    pub epsilon: f64,
    pub iterations: usize,
}

impl DltResection {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<WorldToCamera>
    where
        I: Iterator<Item = WorldMatch> + Clone,
    {
        let count = data.clone().count();
        if count < 6 {
            return None;
        }
        let centroid = data
            .clone()
            .fold(Point3::origin(), |acc, WorldMatch(_, w)| acc + w.coords)
            / count as f64;
        let mean_distance = data
            .clone()
            .map(|WorldMatch(_, w)| (w - centroid).norm())
            .sum::<f64>()
            / count as f64;
        if mean_distance < f64::EPSILON || !mean_distance.is_finite() {
            return None;
        }
        let scale = 3.0f64.sqrt() / mean_distance;
        #[rustfmt::skip]
        let normalization = Matrix4::new(
            scale, 0.0, 0.0, -scale * centroid.x,
            0.0, scale, 0.0, -scale * centroid.y,
            0.0, 0.0, scale, -scale * centroid.z,
            0.0, 0.0, 0.0, 1.0,
        );

        let mut design = DesignMatrix::new(12);
        for WorldMatch(keypoint, world) in data {
            let w = normalization * world.to_homogeneous();
            let (x, y) = (keypoint.x, keypoint.y);
            let mut row = [0.0; 12];
            row[..4].copy_from_slice(w.as_slice());
            for j in 0..4 {
                row[8 + j] = -x * w[j];
            }
            design.push(&row);
            let mut row = [0.0; 12];
            row[4..8].copy_from_slice(w.as_slice());
            for j in 0..4 {
                row[8 + j] = -y * w[j];
            }
            design.push(&row);
        }

        let null = design.null_vector(self.epsilon, self.iterations)?;
        let projection = Matrix3x4::from_row_slice(null.as_slice()) * normalization;
        decompose_projection(projection, self.epsilon, self.iterations)
    }
}

/// Splits `lambda * [R | t]` into a pose, choosing the sign of `lambda` that makes `R` a rotation.
fn decompose_projection(
    mut projection: Matrix3x4<f64>,
    epsilon: f64,
    max_iterations: usize,
) -> Option<WorldToCamera> {
    let left: Matrix3<f64> = projection.fixed_columns::<3>(0).into_owned();
    if left.determinant() < 0.0 {
        projection = -projection;
    }
    let left: Matrix3<f64> = projection.fixed_columns::<3>(0).into_owned();
    let svd = SVD::try_new(left, true, true, epsilon, max_iterations)?;
    let lambda = svd.singular_values.sum() / 3.0;
    if lambda <= f64::EPSILON || !lambda.is_finite() {
        return None;
    }
    let rotation = svd.u? * svd.v_t?;
    if rotation.determinant() <= 0.0 {
        return None;
    }
    let translation = projection.column(3).into_owned() / lambda;
    Some(WorldToCamera::from_parts(
        translation,
        Rotation3::from_matrix_unchecked(rotation),
    ))
}

impl Default for DltResection {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<WorldMatch> for DltResection {
    type Model = WorldToCamera;
    type ModelIter = Option<WorldToCamera>;
    const MIN_SAMPLES: usize = 6;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = WorldMatch> + Clone,
    {
        self.from_matches(data)
    }
}
