use crate::linear::{hartley_normalization, transform_point, DesignMatrix};
use crate::PixelMatch;
use sample_consensus::{Estimator, Model};
use sfm_core::nalgebra::{Matrix3, Point2};

/// A planar homography mapping pixel coordinates of image A onto image B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Homography {
    /// Returns `None` if the matrix is singular.
    pub fn new(matrix: Matrix3<f64>) -> Option<Self> {
        let inverse = matrix.try_inverse()?;
        Some(Self { matrix, inverse })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Maps a point of image A onto image B.
    pub fn transfer(&self, point: Point2<f64>) -> Option<Point2<f64>> {
        apply(&self.matrix, point)
    }

    /// Maps a point of image B onto image A.
    pub fn transfer_inverse(&self, point: Point2<f64>) -> Option<Point2<f64>> {
        apply(&self.inverse, point)
    }

    /// Mean of the forward and backward transfer errors in pixels.
    pub fn symmetric_transfer_error(&self, data: &PixelMatch) -> f64 {
        let &PixelMatch(a, b) = data;
        match (self.transfer(a), self.transfer_inverse(b)) {
            (Some(ab), Some(ba)) => 0.5 * ((ab - b).norm() + (ba - a).norm()),
            _ => f64::INFINITY,
        }
    }
}

fn apply(matrix: &Matrix3<f64>, point: Point2<f64>) -> Option<Point2<f64>> {
    let h = matrix * point.to_homogeneous();
    if h.z.abs() > f64::EPSILON {
        Some(Point2::new(h.x / h.z, h.y / h.z))
    } else {
        None
    }
}

impl Model<PixelMatch> for Homography {
    fn residual(&self, data: &PixelMatch) -> f64 {
        self.symmetric_transfer_error(data)
    }
}

/// Normalized direct linear transform for homographies from four or more matches.
#[derive(Copy, Clone, Debug)]
pub struct FourPoint {
    pub epsilon: f64,
    pub iterations: usize,
}

impl FourPoint {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<Homography>
    where
        I: Iterator<Item = PixelMatch> + Clone,
    {
        let ta = hartley_normalization(data.clone().map(|PixelMatch(a, _)| a))?;
        let tb = hartley_normalization(data.clone().map(|PixelMatch(_, b)| b))?;
        let mut design = DesignMatrix::new(9);
        for PixelMatch(a, b) in data {
            let a = transform_point(&ta, a);
            let b = transform_point(&tb, b);
            design.push(&[-a.x, -a.y, -1.0, 0.0, 0.0, 0.0, b.x * a.x, b.x * a.y, b.x]);
            design.push(&[0.0, 0.0, 0.0, -a.x, -a.y, -1.0, b.y * a.x, b.y * a.y, b.y]);
        }
        if design.rows() < 8 {
            return None;
        }
        let null = design.null_vector(self.epsilon, self.iterations)?;
        let normalized = Matrix3::from_row_slice(null.as_slice());
        let matrix = tb.try_inverse()? * normalized * ta;
        let scale = matrix[(2, 2)];
        let matrix = if scale.abs() > f64::EPSILON {
            matrix / scale
        } else {
            matrix
        };
        Homography::new(matrix)
    }
}

impl Default for FourPoint {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<PixelMatch> for FourPoint {
    type Model = Homography;
    type ModelIter = Option<Homography>;
    const MIN_SAMPLES: usize = 4;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PixelMatch> + Clone,
    {
        self.from_matches(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_exact_homography() {
        let truth = Matrix3::new(1.1, 0.05, 12.0, -0.03, 0.95, -4.0, 1e-4, -2e-4, 1.0);
        let truth = Homography::new(truth).unwrap();
        let matches: Vec<PixelMatch> = [(10.0, 20.0), (200.0, 15.0), (180.0, 170.0), (5.0, 160.0), (90.0, 90.0)]
            .iter()
            .map(|&(x, y)| {
                let a = Point2::new(x, y);
                PixelMatch(a, truth.transfer(a).unwrap())
            })
            .collect();
        let estimate = FourPoint::new().from_matches(matches.iter().copied()).unwrap();
        assert_relative_eq!(*estimate.matrix(), *truth.matrix(), epsilon = 1e-6);
        for m in &matches {
            assert!(estimate.residual(m) < 1e-6);
        }
    }
}
