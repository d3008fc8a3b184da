//! Shared pieces of the direct linear transform solvers.

use float_ord::FloatOrd;
use sfm_core::nalgebra::{DMatrix, DVector, Matrix3, Point2, SVD};

/// The rows of a homogeneous linear system `A x = 0`, one constraint at a time.
pub(crate) struct DesignMatrix {
    columns: usize,
    entries: Vec<f64>,
}

impl DesignMatrix {
    pub(crate) fn new(columns: usize) -> Self {
        Self {
            columns,
            entries: vec![],
        }
    }

    pub(crate) fn push(&mut self, row: &[f64]) {
        debug_assert_eq!(row.len(), self.columns);
        self.entries.extend_from_slice(row);
    }

    pub(crate) fn rows(&self) -> usize {
        self.entries.len() / self.columns
    }

    /// The unit vector `x` minimizing `|A x|`: the right singular vector of the smallest
    /// singular value of `A`.
    ///
    /// `A` is decomposed directly rather than through `A^T A`, which would square its condition
    /// number. Fewer rows than columns are padded with zero rows so that the null space shows up
    /// among the singular vectors.
    pub(crate) fn null_vector(self, epsilon: f64, max_iterations: usize) -> Option<DVector<f64>> {
        let rows = self.rows().max(self.columns);
        let mut entries = self.entries;
        entries.resize(rows * self.columns, 0.0);
        let a = DMatrix::from_row_slice(rows, self.columns, &entries);
        let svd = SVD::try_new(a, false, true, epsilon, max_iterations)?;
        let (smallest, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))?;
        let v_t = svd.v_t?;
        let null: DVector<f64> = v_t.row(smallest).transpose();
        null.iter().all(|n| n.is_finite()).then(|| null)
    }
}

/// Similarity transform that moves the centroid of a point set to the origin and makes the
/// mean distance from it `sqrt(2)`, as recommended by Hartley for linear estimation.
pub(crate) fn hartley_normalization(points: impl Iterator<Item = Point2<f64>> + Clone) -> Option<Matrix3<f64>> {
    let count = points.clone().count();
    if count == 0 {
        return None;
    }
    let centroid = points.clone().fold(Point2::origin(), |acc, p| acc + p.coords) / count as f64;
    let mean_distance =
        points.map(|p| (p - centroid).norm()).sum::<f64>() / count as f64;
    if mean_distance < f64::EPSILON || !mean_distance.is_finite() {
        return None;
    }
    let scale = std::f64::consts::SQRT_2 / mean_distance;
    Some(Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

pub(crate) fn transform_point(transform: &Matrix3<f64>, point: Point2<f64>) -> Point2<f64> {
    let h = transform * point.to_homogeneous();
    Point2::new(h.x / h.z, h.y / h.z)
}

/// The epipolar constraint row for `b^T * F * a = 0` with `F` in row-major order.
pub(crate) fn epipolar_row(a: Point2<f64>, b: Point2<f64>) -> [f64; 9] {
    [
        b.x * a.x,
        b.x * a.y,
        b.x,
        b.y * a.x,
        b.y * a.y,
        b.y,
        a.x,
        a.y,
        1.0,
    ]
}

/// Sampson approximation of the geometric error of a match against a fundamental-like matrix.
pub(crate) fn sampson_distance(matrix: &Matrix3<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    let xa = a.to_homogeneous();
    let xb = b.to_homogeneous();
    let fa = matrix * xa;
    let ftb = matrix.transpose() * xb;
    let numerator = xb.dot(&fa);
    let denominator = fa.x * fa.x + fa.y * fa.y + ftb.x * ftb.x + ftb.y * ftb.y;
    if numerator == 0.0 {
        0.0
    } else if denominator > 0.0 {
        (numerator * numerator / denominator).sqrt()
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn null_vector_of_an_ill_conditioned_system() {
        // Rows orthogonal to (1, -2, 1e-4) with column scales spread over eight orders.
        let expected = DVector::from_row_slice(&[1.0, -2.0, 1e-4]).normalize();
        let mut design = DesignMatrix::new(3);
        for &(x, y) in &[(2.0, 1.0), (4.0, 2.5), (1e-3, 3.0), (7.0, -1.0)] {
            let z = -(x * expected[0] + y * expected[1]) / expected[2];
            design.push(&[x, y, z]);
        }
        let null = design.null_vector(1e-15, 1000).unwrap();
        let null = if null[0] < 0.0 { -null } else { null };
        assert_relative_eq!(null, expected, epsilon = 1e-10);
    }

    #[test]
    fn short_systems_are_padded() {
        let mut design = DesignMatrix::new(3);
        design.push(&[1.0, 0.0, 0.0]);
        design.push(&[0.0, 1.0, 0.0]);
        assert_eq!(design.rows(), 2);
        let null = design.null_vector(1e-15, 1000).unwrap();
        assert_relative_eq!(null[2].abs(), 1.0, epsilon = 1e-12);
    }
}
