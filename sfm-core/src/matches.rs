use crate::{BackendId, ImageId, TrackId};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// An unordered pair of distinct images.
///
/// The smaller id is always stored first, so `(A, B)` and `(B, A)` produce the same key
/// and sorting by key is the canonical processing order of pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PairKey(ImageId, ImageId);

impl PairKey {
    /// Returns `None` when both ids are the same image.
    pub fn new(a: ImageId, b: ImageId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self(a, b)),
            std::cmp::Ordering::Greater => Some(Self(b, a)),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn first(self) -> ImageId {
        self.0
    }

    pub fn second(self) -> ImageId {
        self.1
    }

    pub fn contains(self, image: ImageId) -> bool {
        self.0 == image || self.1 == image
    }

    /// The other image of the pair, if `image` is part of it.
    pub fn other(self, image: ImageId) -> Option<ImageId> {
        if self.0 == image {
            Some(self.1)
        } else if self.1 == image {
            Some(self.0)
        } else {
            None
        }
    }

    /// A stable 64 bit value derived from the key, used to seed per-pair random generators.
    pub fn stable_hash(self) -> u64 {
        (u64::from(self.0 .0) << 32 | u64::from(self.1 .0)).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

/// A pair of images selected for matching along with its retrieval similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CandidatePair {
    pub key: PairKey,
    pub score: f32,
}

/// A match between keypoint `keypoint_a` of `image_a` and keypoint `keypoint_b` of `image_b`,
/// both indexed in the keypoint set `backend` produced for the respective image.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Correspondence {
    pub image_a: ImageId,
    pub keypoint_a: u32,
    pub image_b: ImageId,
    pub keypoint_b: u32,
    pub backend: BackendId,
    /// Confidence of the match in `[0, 1]`.
    pub confidence: f32,
}

impl Correspondence {
    pub fn pair(&self) -> Option<PairKey> {
        PairKey::new(self.image_a, self.image_b)
    }
}

/// All verified correspondences produced for one pair by one backend.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct VerifiedPair {
    pub pair: PairKey,
    pub backend: BackendId,
    /// Number of putative matches before geometric verification.
    pub putative: usize,
    pub correspondences: Vec<Correspondence>,
}

/// One keypoint of one image.
///
/// The keypoint index refers to the fused keypoint list of the image, where the keypoints
/// of every backend are concatenated in backend order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Observation {
    pub image: ImageId,
    pub keypoint: u32,
}

/// A set of keypoints across at least two images believed to see the same 3d point.
///
/// No two observations of a track belong to the same image. Observations are sorted by image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Track {
    pub id: TrackId,
    pub observations: Vec<Observation>,
}

impl Track {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observation(&self, image: ImageId) -> Option<Observation> {
        self.observations
            .binary_search_by_key(&image, |o| o.image)
            .ok()
            .map(|ix| self.observations[ix])
    }

    pub fn images(&self) -> impl Iterator<Item = ImageId> + Clone + '_ {
        self.observations.iter().map(|o| o.image)
    }

    /// Checks that no image contributes more than one keypoint.
    pub fn is_consistent(&self) -> bool {
        self.observations.windows(2).all(|w| w[0].image < w[1].image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_images_can_be_walked_twice() {
        let track = Track {
            id: TrackId(0),
            observations: [0, 2, 5]
                .iter()
                .map(|&image| Observation {
                    image: ImageId(image),
                    keypoint: 1,
                })
                .collect(),
        };
        let images = track.images();
        let pairs: Vec<(ImageId, ImageId)> = images
            .clone()
            .enumerate()
            .flat_map(|(ix, a)| images.clone().skip(ix + 1).map(move |b| (a, b)))
            .collect();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2], (ImageId(2), ImageId(5)));
        assert!(track.is_consistent());
    }
}
