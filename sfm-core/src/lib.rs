//! # SfM Core
//!
//! Common types shared by every crate of the reconstruction pipeline: image and track
//! identifiers, keypoint sets produced by feature backends, candidate pairs, correspondences,
//! camera intrinsics, poses and the reconstruction itself.
//!
//! Coordinates follow the usual computer vision conventions:
//!
//! * Pixel coordinates have `x` to the right and `y` down with the origin at the top left pixel.
//! * Normalized image coordinates are pixel coordinates with the intrinsics removed, so that a
//!   bearing out of the optical center is `(x, y, 1.0)`.
//! * Camera space has positive `z` forwards, `y` down and `x` right.
//!
//! Serialization of every type is gated behind the `serde-serialize` feature.

mod camera;
mod ids;
mod keypoint;
mod matches;
mod pose;
mod reconstruction;
mod state;

pub use bitarray;
pub use camera::*;
pub use ids::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use pose::*;
pub use reconstruction::*;
pub use space;
pub use state::*;
