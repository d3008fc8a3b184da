//! # SfM Geometry
//!
//! Estimators and refinement used to verify matches and to build a reconstruction.
//!
//! Every minimal solver implements [`sample_consensus::Estimator`] and every model implements
//! [`sample_consensus::Model`], so they can be plugged into any consensus algorithm such as ARRSAC:
//!
//! * [`NormalizedEightPoint`] estimates a [`FundamentalMatrix`] from [`PixelMatch`]es.
//! * [`FourPoint`] estimates a [`Homography`] from [`PixelMatch`]es.
//! * [`EightPoint`] estimates an [`EssentialMatrix`] from [`NormalizedMatch`]es.
//! * [`DltResection`] estimates a [`WorldToCamera`](sfm_core::WorldToCamera) from [`WorldMatch`]es.
//!
//! Residuals of pixel models are in pixels. Residuals of calibrated models are in normalized
//! image units, so divide a pixel threshold by the focal length before using it with them.

mod essential;
mod fundamental;
mod homography;
mod linear;
mod optimize;
mod resection;
mod triangulation;

pub use essential::*;
pub use fundamental::*;
pub use homography::*;
pub use optimize::*;
pub use resection::*;
pub use sample_consensus;
pub use triangulation::*;

use sfm_core::nalgebra::{Point2, Point3};

/// A match between two pixel coordinates of two images.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct PixelMatch(pub Point2<f64>, pub Point2<f64>);

/// A match between two normalized image coordinates of two calibrated images.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct NormalizedMatch(pub Point2<f64>, pub Point2<f64>);

/// A match between a normalized image coordinate and a world point.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct WorldMatch(pub Point2<f64>, pub Point3<f64>);
