use derive_more::{Display, From, Into};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Identifies an image inside a scene.
///
/// Images are numbered in ascending order of their file name, so ordering by id is the
/// same as ordering by name. This is what makes id-based tie breaking reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ImageId(pub u32);

impl ImageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies one configured feature backend of a scene by its slot in the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BackendId(pub u8);

impl BackendId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a track of the fused track graph, and therefore a 3d point once triangulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TrackId(pub u32);

impl TrackId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
