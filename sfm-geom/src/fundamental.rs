use crate::linear::{epipolar_row, hartley_normalization, sampson_distance, transform_point, DesignMatrix};
use crate::PixelMatch;
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use sample_consensus::{Estimator, Model};
use sfm_core::nalgebra::{Matrix3, SVD};

/// A fundamental matrix satisfying `transpose(b) * F * a = 0` for pixel coordinates `a` and `b`
/// of the same point seen in two uncalibrated images.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
pub struct FundamentalMatrix(pub Matrix3<f64>);

impl FundamentalMatrix {
    /// Forces the smallest singular value to zero, which makes every epipolar line pass through
    /// a single epipole.
    pub fn enforce_rank_two(self, epsilon: f64, max_iterations: usize) -> Option<Self> {
        let mut svd = SVD::try_new(self.0, true, true, epsilon, max_iterations)?;
        let (smallest, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| float_ord::FloatOrd(n))?;
        svd.singular_values[smallest] = 0.0;
        let mat = svd.recompose().ok()?;
        let norm = mat.norm();
        if norm > 0.0 && norm.is_finite() {
            Some(Self(mat / norm))
        } else {
            None
        }
    }

    /// First-order geometric error of the match in pixels.
    pub fn sampson_distance(&self, data: &PixelMatch) -> f64 {
        sampson_distance(&self.0, data.0, data.1)
    }
}

impl Model<PixelMatch> for FundamentalMatrix {
    fn residual(&self, data: &PixelMatch) -> f64 {
        self.sampson_distance(data)
    }
}

/// The eight-point algorithm on pixel coordinates with Hartley normalization of each image's
/// points and rank-two enforcement of the result.
#[derive(Copy, Clone, Debug)]
pub struct NormalizedEightPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl NormalizedEightPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<FundamentalMatrix>
    where
        I: Iterator<Item = PixelMatch> + Clone,
    {
        let ta = hartley_normalization(data.clone().map(|PixelMatch(a, _)| a))?;
        let tb = hartley_normalization(data.clone().map(|PixelMatch(_, b)| b))?;
        let mut design = DesignMatrix::new(9);
        for PixelMatch(a, b) in data {
            design.push(&epipolar_row(transform_point(&ta, a), transform_point(&tb, b)));
        }
        if design.rows() < 8 {
            return None;
        }
        let null = design.null_vector(self.epsilon, self.iterations)?;
        let normalized = Matrix3::from_row_slice(null.as_slice());
        FundamentalMatrix(tb.transpose() * normalized * ta).enforce_rank_two(self.epsilon, self.iterations)
    }
}

impl Default for NormalizedEightPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<PixelMatch> for NormalizedEightPoint {
    type Model = FundamentalMatrix;
    type ModelIter = Option<FundamentalMatrix>;
    const MIN_SAMPLES: usize = 8;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PixelMatch> + Clone,
    {
        self.from_matches(data)
    }
}
