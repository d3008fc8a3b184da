//! Fusion of the verified correspondences of every backend into tracks.

use crate::features::SceneFeatures;
use float_ord::FloatOrd;
use serde::{Deserialize, Serialize};
use sfm_core::{BackendId, Correspondence, ImageId, Observation, Track, TrackId, VerifiedPair};

/// Where the keypoints of each backend start in the fused keypoint list of each image.
///
/// The fused list of an image is the concatenation of the keypoints of every backend in
/// backend order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeypointLayout {
    /// Indexed by image, then backend. The last entry of every image is its total.
    offsets: Vec<Vec<u32>>,
}

impl KeypointLayout {
    pub fn new(features: &SceneFeatures) -> Self {
        let offsets = (0..features.images())
            .map(|image| {
                let image = ImageId(image as u32);
                let mut offsets = Vec::with_capacity(features.backends() + 1);
                let mut total = 0u32;
                offsets.push(0);
                for backend in 0..features.backends() {
                    total += features.count(BackendId(backend as u8), image) as u32;
                    offsets.push(total);
                }
                offsets
            })
            .collect();
        Self { offsets }
    }

    /// The index of a backend keypoint in the fused list of its image.
    pub fn fused(&self, image: ImageId, backend: BackendId, keypoint: u32) -> u32 {
        self.offsets
            .get(image.index())
            .and_then(|offsets| offsets.get(backend.index()))
            .copied()
            .unwrap_or(0)
            + keypoint
    }

    /// The backend and backend keypoint index of a fused keypoint.
    pub fn split(&self, image: ImageId, fused: u32) -> Option<(BackendId, u32)> {
        let offsets = self.offsets.get(image.index())?;
        let backend = offsets.windows(2).position(|w| fused >= w[0] && fused < w[1])?;
        Some((BackendId(backend as u8), fused - offsets[backend]))
    }

    pub fn total(&self, image: ImageId) -> u32 {
        self.offsets
            .get(image.index())
            .and_then(|offsets| offsets.last())
            .copied()
            .unwrap_or(0)
    }
}

/// The tracks of a scene and how many correspondences ended up in them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FusionResult {
    /// Sorted by id. Ids are assigned in order of the smallest observation of each track.
    pub tracks: Vec<Track>,
    pub accepted: usize,
    /// Correspondences discarded because they would put two keypoints of one image in a track.
    pub rejected: usize,
}

/// A union-find forest over observation indices. Every root knows the sorted images of its set.
struct Forest {
    parent: Vec<u32>,
    size: Vec<u32>,
    images: Vec<Vec<ImageId>>,
}

impl Forest {
    fn new(nodes: &[Observation]) -> Self {
        Self {
            parent: (0..nodes.len() as u32).collect(),
            size: vec![1; nodes.len()],
            images: nodes.iter().map(|node| vec![node.image]).collect(),
        }
    }

    fn find(&mut self, mut node: u32) -> u32 {
        while self.parent[node as usize] != node {
            let grandparent = self.parent[self.parent[node as usize] as usize];
            self.parent[node as usize] = grandparent;
            node = grandparent;
        }
        node
    }

    /// Merges the sets of `a` and `b` unless they share an image.
    ///
    /// Returns `false` if the merge was refused.
    fn union(&mut self, a: u32, b: u32) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return true;
        }
        if shares_image(&self.images[ra as usize], &self.images[rb as usize]) {
            return false;
        }
        if self.size[ra as usize] < self.size[rb as usize] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb as usize] = ra;
        self.size[ra as usize] += self.size[rb as usize];
        let moved = std::mem::take(&mut self.images[rb as usize]);
        let merged = &mut self.images[ra as usize];
        merged.extend(moved);
        merged.sort_unstable();
        true
    }
}

fn shares_image(a: &[ImageId], b: &[ImageId]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => return true,
        }
    }
    false
}

/// Merges verified correspondences into tracks.
///
/// Correspondences are processed from the most to the least confident, ties broken by the
/// keypoints and backend involved, so the result does not depend on the input order. A
/// correspondence that would join two sets already containing a keypoint of the same image is
/// discarded, which lets the more confident correspondences that built those sets win.
pub fn fuse(verified: &[VerifiedPair], layout: &KeypointLayout) -> FusionResult {
    let observation = |image: ImageId, backend: BackendId, keypoint: u32| Observation {
        image,
        keypoint: layout.fused(image, backend, keypoint),
    };
    let mut edges: Vec<(Observation, Observation, &Correspondence)> = verified
        .iter()
        .flat_map(|pair| pair.correspondences.iter())
        .filter(|c| c.image_a != c.image_b)
        .map(|c| {
            let a = observation(c.image_a, c.backend, c.keypoint_a);
            let b = observation(c.image_b, c.backend, c.keypoint_b);
            (a.min(b), a.max(b), c)
        })
        .collect();
    edges.sort_by(|x, y| {
        FloatOrd(y.2.confidence + 0.0)
            .cmp(&FloatOrd(x.2.confidence + 0.0))
            .then((x.0, x.1, x.2.backend).cmp(&(y.0, y.1, y.2.backend)))
    });

    let mut nodes: Vec<Observation> = edges.iter().flat_map(|&(a, b, _)| [a, b]).collect();
    nodes.sort_unstable();
    nodes.dedup();
    let index = |node: &Observation| nodes.binary_search(node).map(|ix| ix as u32);

    let mut forest = Forest::new(&nodes);
    let (mut accepted, mut rejected) = (0, 0);
    for (a, b, _) in &edges {
        let (a, b) = match (index(a), index(b)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => continue,
        };
        if forest.union(a, b) {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }

    // Nodes are sorted, so the first node reaching a root is the smallest of its set.
    let mut root_track: Vec<Option<usize>> = vec![None; nodes.len()];
    let mut groups: Vec<Vec<Observation>> = vec![];
    for (ix, &node) in nodes.iter().enumerate() {
        let root = forest.find(ix as u32) as usize;
        let group = *root_track[root].get_or_insert_with(|| {
            groups.push(vec![]);
            groups.len() - 1
        });
        groups[group].push(node);
    }

    let tracks = groups
        .into_iter()
        .filter(|group| group.len() >= 2)
        .enumerate()
        .map(|(id, mut observations)| {
            observations.sort_unstable();
            Track {
                id: TrackId(id as u32),
                observations,
            }
        })
        .collect();
    FusionResult {
        tracks,
        accepted,
        rejected,
    }
}
