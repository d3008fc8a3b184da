use crate::ImageId;
use bitarray::BitArray;
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::Point2;
use space::Metric;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A point on an image frame in pixel coordinates.
///
/// This is neither undistorted nor normalized. Use [`CameraIntrinsics::calibrate`](crate::CameraIntrinsics::calibrate)
/// to get normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeyPoint(pub Point2<f64>);

/// A detected keypoint with its optional scale and orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Keypoint {
    pub point: KeyPoint,
    /// Detector response. Larger is stronger.
    pub response: f32,
    pub scale: Option<f32>,
    /// Orientation in radians, measured from the `x` axis towards the `y` axis.
    pub orientation: Option<f32>,
}

impl Keypoint {
    pub fn new(x: f64, y: f64, response: f32) -> Self {
        Self {
            point: KeyPoint(Point2::new(x, y)),
            response,
            scale: None,
            orientation: None,
        }
    }

    #[must_use]
    pub fn with_scale(self, scale: f32) -> Self {
        Self {
            scale: Some(scale),
            ..self
        }
    }

    #[must_use]
    pub fn with_orientation(self, orientation: f32) -> Self {
        Self {
            orientation: Some(orientation),
            ..self
        }
    }
}

/// The number of bytes of every binary descriptor.
pub const BINARY_DESCRIPTOR_BYTES: usize = 32;

/// A bit string descriptor compared with the [`Hamming`](bitarray::Hamming) distance.
pub type BinaryDescriptor = BitArray<BINARY_DESCRIPTOR_BYTES>;

/// The euclidean distance between real valued descriptors.
///
/// Distances are never negative, so their bit patterns sort the same way as their values. The
/// distance is carried as those bits to satisfy the integer units of [`Metric`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Euclidean;

impl Euclidean {
    /// Recovers the distance from the unit returned by the metric.
    pub fn value(unit: u32) -> f32 {
        f32::from_bits(unit)
    }
}

#[allow(clippy::ptr_arg)]
impl Metric<Vec<f32>> for Euclidean {
    type Unit = u32;

    fn distance(&self, a: &Vec<f32>, b: &Vec<f32>) -> u32 {
        let squared: f32 = a.iter().zip(b).map(|(a, b)| (a - b) * (a - b)).sum();
        // Adding zero turns a -0.0 into 0.0.
        (squared.sqrt() + 0.0).to_bits()
    }
}

/// The descriptors of a keypoint set, one per keypoint.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum Descriptors {
    /// Real valued descriptors of the given dimension compared with [`Euclidean`].
    Float { dimension: usize, data: Vec<Vec<f32>> },
    /// Bit string descriptors compared with the hamming distance.
    Binary(Vec<BinaryDescriptor>),
}

impl Descriptors {
    pub fn empty_float(dimension: usize) -> Self {
        Self::Float {
            dimension,
            data: vec![],
        }
    }

    pub fn empty_binary() -> Self {
        Self::Binary(vec![])
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float { data, .. } => data.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two descriptor sets can be compared with each other.
    pub fn compatible(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float { dimension: a, .. }, Self::Float { dimension: b, .. }) => a == b,
            (Self::Binary(_), Self::Binary(_)) => true,
            _ => false,
        }
    }

    /// Appends a real valued descriptor. Ignored unless the set holds real valued descriptors of
    /// the same dimension.
    pub fn push_float(&mut self, descriptor: &[f32]) {
        if let Self::Float { dimension, data } = self {
            debug_assert_eq!(*dimension, descriptor.len());
            if *dimension == descriptor.len() {
                data.push(descriptor.to_vec());
            }
        }
    }

    /// Appends a binary descriptor. Ignored unless the set holds binary descriptors.
    pub fn push_binary(&mut self, descriptor: BinaryDescriptor) {
        if let Self::Binary(data) = self {
            data.push(descriptor);
        }
    }
}

/// A clockwise rotation of an image by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum QuarterTurn {
    R0,
    R90,
    R180,
    R270,
}

impl Default for QuarterTurn {
    fn default() -> Self {
        Self::R0
    }
}

impl QuarterTurn {
    pub fn degrees(self) -> u32 {
        match self {
            Self::R0 => 0,
            Self::R90 => 90,
            Self::R180 => 180,
            Self::R270 => 270,
        }
    }

    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::R0),
            90 => Some(Self::R90),
            180 => Some(Self::R180),
            270 => Some(Self::R270),
            _ => None,
        }
    }

    pub fn radians(self) -> f64 {
        f64::from(self.degrees()).to_radians()
    }

    /// Dimensions of an image of `width` x `height` after applying this rotation.
    pub fn rotated_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::R0 | Self::R180 => (width, height),
            Self::R90 | Self::R270 => (height, width),
        }
    }

    /// Maps a pixel coordinate of the rotated image back onto the image before rotation.
    ///
    /// `rotated_width` and `rotated_height` are the dimensions of the rotated image.
    pub fn to_original(self, point: Point2<f64>, rotated_width: u32, rotated_height: u32) -> Point2<f64> {
        let (w, h) = (f64::from(rotated_width), f64::from(rotated_height));
        match self {
            Self::R0 => point,
            Self::R90 => Point2::new(point.y, w - point.x - 1.0),
            Self::R180 => Point2::new(w - point.x - 1.0, h - point.y - 1.0),
            Self::R270 => Point2::new(h - point.y - 1.0, point.x),
        }
    }
}

/// The frame the keypoint coordinates of a [`KeypointSet`] are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum KeypointFrame {
    /// Pixel coordinates of the image as stored on disk.
    Original,
    /// Pixel coordinates of the image after it was rotated clockwise by `turn`.
    ///
    /// `width` and `height` are the dimensions of the rotated image.
    Rotated {
        turn: QuarterTurn,
        width: u32,
        height: u32,
    },
}

/// The keypoints and descriptors produced by one backend for one image.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeypointSet {
    pub image: ImageId,
    pub frame: KeypointFrame,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
}

impl KeypointSet {
    pub fn new(image: ImageId, descriptors: Descriptors) -> Self {
        Self {
            image,
            frame: KeypointFrame::Original,
            keypoints: vec![],
            descriptors,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn keypoint(&self, ix: usize) -> KeyPoint {
        self.keypoints[ix].point
    }

    /// Pixel locations of every keypoint in order.
    pub fn points(&self) -> impl Iterator<Item = Point2<f64>> + Clone + '_ {
        self.keypoints.iter().map(|kp| kp.point.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitarray::Hamming;

    #[test]
    fn euclidean_units_sort_like_distances() {
        let origin = vec![0.0, 0.0];
        let near = Euclidean.distance(&origin, &vec![0.6, 0.8]);
        let far = Euclidean.distance(&origin, &vec![3.0, 4.0]);
        assert_eq!(Euclidean::value(near), 1.0);
        assert_eq!(Euclidean::value(far), 5.0);
        assert!(near < far);
        assert_eq!(Euclidean.distance(&origin, &vec![-0.0, 0.0]), 0);
    }

    #[test]
    fn binary_descriptors_use_hamming() {
        let mut descriptors = Descriptors::empty_binary();
        let mut bytes = [0u8; BINARY_DESCRIPTOR_BYTES];
        descriptors.push_binary(BitArray::new(bytes));
        bytes[0] = 0b1011;
        descriptors.push_binary(BitArray::new(bytes));
        descriptors.push_float(&[1.0]);
        assert_eq!(descriptors.len(), 2);
        if let Descriptors::Binary(data) = &descriptors {
            assert_eq!(Hamming.distance(&data[0], &data[1]), 3);
        }
        assert!(descriptors.compatible(&Descriptors::empty_binary()));
        assert!(!descriptors.compatible(&Descriptors::empty_float(2)));
    }
}
