//! Selection of the image pairs worth matching.

use crate::retrieval::Ranking;
use float_ord::FloatOrd;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sfm_core::{CandidatePair, ImageId, PairKey};
use std::collections::{BTreeMap, BTreeSet};

/// The covisibility graph to match along with the images it leaves without any pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PairSelection {
    /// Sorted by key, which is the order pairs are matched and fused in.
    pub pairs: Vec<CandidatePair>,
    /// Images without any candidate pair, sorted by id.
    pub isolated: Vec<ImageId>,
}

impl PairSelection {
    /// The number of pairs every image takes part in. Isolated images are absent.
    pub fn degrees(&self) -> BTreeMap<ImageId, usize> {
        let mut degrees = BTreeMap::new();
        for pair in &self.pairs {
            *degrees.entry(pair.key.first()).or_default() += 1;
            *degrees.entry(pair.key.second()).or_default() += 1;
        }
        degrees
    }

    fn from_pairs(mut pairs: Vec<CandidatePair>, all_images: &[ImageId]) -> Self {
        pairs.sort_by_key(|pair| pair.key);
        let connected: BTreeSet<ImageId> = pairs
            .iter()
            .flat_map(|pair| [pair.key.first(), pair.key.second()])
            .collect();
        let isolated = all_images
            .iter()
            .copied()
            .filter(|image| !connected.contains(image))
            .sorted()
            .dedup()
            .collect();
        Self { pairs, isolated }
    }
}

/// Builds a pair graph from retrieval rankings where no image takes part in more than
/// `max_pairs_per_image` pairs.
///
/// Symmetric rankings are merged keeping the best score. Edges are accepted greedily from the
/// most similar down, skipping edges that would exceed the degree bound of either image. An
/// image left without any edge afterwards gets its most similar edge regardless of the bound of
/// the other image, so only images that were never ranked end up isolated.
pub fn select(rankings: &[Ranking], max_pairs_per_image: usize, all_images: &[ImageId]) -> PairSelection {
    let max_degree = max_pairs_per_image.max(1);
    let mut scores: BTreeMap<PairKey, f32> = BTreeMap::new();
    for ranking in rankings {
        for &(neighbor, score) in &ranking.neighbors {
            if let Some(key) = PairKey::new(ranking.query, neighbor) {
                let entry = scores.entry(key).or_insert(score);
                if score > *entry {
                    *entry = score;
                }
            }
        }
    }

    let candidates: Vec<CandidatePair> = scores
        .into_iter()
        .map(|(key, score)| CandidatePair { key, score })
        .sorted_by(|a, b| {
            // -0.0 and 0.0 are the same score.
            FloatOrd(b.score + 0.0)
                .cmp(&FloatOrd(a.score + 0.0))
                .then(a.key.cmp(&b.key))
        })
        .collect();

    let mut degree: BTreeMap<ImageId, usize> = BTreeMap::new();
    let mut accepted = vec![];
    let mut rejected = vec![];
    for candidate in candidates {
        let (a, b) = (candidate.key.first(), candidate.key.second());
        let room = |image: ImageId| degree.get(&image).copied().unwrap_or(0) < max_degree;
        if room(a) && room(b) {
            *degree.entry(a).or_default() += 1;
            *degree.entry(b).or_default() += 1;
            accepted.push(candidate);
        } else {
            rejected.push(candidate);
        }
    }

    // Rejected candidates are still ordered best first, so the first hit is the best edge.
    for candidate in rejected {
        let (a, b) = (candidate.key.first(), candidate.key.second());
        if !degree.contains_key(&a) || !degree.contains_key(&b) {
            *degree.entry(a).or_default() += 1;
            *degree.entry(b).or_default() += 1;
            accepted.push(candidate);
        }
    }

    PairSelection::from_pairs(accepted, all_images)
}

/// Every pair of the usable images. Used when a scene is small enough to match exhaustively.
pub fn exhaustive(usable: &[ImageId], all_images: &[ImageId]) -> PairSelection {
    let pairs = usable
        .iter()
        .tuple_combinations()
        .filter_map(|(&a, &b)| PairKey::new(a, b))
        .map(|key| CandidatePair { key, score: 1.0 })
        .collect();
    PairSelection::from_pairs(pairs, all_images)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking(query: u32, neighbors: &[(u32, f32)]) -> Ranking {
        Ranking {
            query: ImageId(query),
            neighbors: neighbors.iter().map(|&(id, s)| (ImageId(id), s)).collect(),
        }
    }

    fn ids(n: u32) -> Vec<ImageId> {
        (0..n).map(ImageId).collect()
    }

    #[test]
    fn symmetric_rankings_are_deduplicated() {
        let rankings = vec![ranking(0, &[(1, 0.9)]), ranking(1, &[(0, 0.7)])];
        let selection = select(&rankings, 5, &ids(2));
        assert_eq!(selection.pairs.len(), 1);
        assert_eq!(selection.pairs[0].score, 0.9);
        assert!(selection.isolated.is_empty());
    }

    #[test]
    fn degree_is_bounded() {
        // Image 0 is everybody's favorite.
        let rankings: Vec<Ranking> = (1..8)
            .map(|q| ranking(q, &[(0, 0.9), ((q % 7) + 1, 0.5)]))
            .collect();
        let selection = select(&rankings, 2, &ids(8));
        let degrees = selection.degrees();
        assert_eq!(degrees[&ImageId(0)], 2);
        assert!(degrees.values().all(|&d| d <= 3));
        assert!(selection.isolated.is_empty());
        assert!(selection.pairs.windows(2).all(|w| w[0].key < w[1].key));
    }

    #[test]
    fn signed_zero_scores_tie_on_key() {
        let rankings = vec![
            ranking(0, &[(4, 0.9), (1, -0.0), (2, 0.0)]),
            ranking(2, &[(3, 0.9)]),
        ];
        let selection = select(&rankings, 2, &ids(5));
        let keys: Vec<(u32, u32)> = selection
            .pairs
            .iter()
            .map(|p| (p.key.first().0, p.key.second().0))
            .collect();
        assert_eq!(keys, vec![(0, 1), (0, 4), (2, 3)]);
    }

    #[test]
    fn unranked_images_are_isolated() {
        let rankings = vec![ranking(0, &[(1, 0.9)]), ranking(1, &[(0, 0.9)])];
        let selection = select(&rankings, 5, &ids(4));
        assert_eq!(selection.isolated, vec![ImageId(2), ImageId(3)]);
    }

    #[test]
    fn exhaustive_pairs() {
        let selection = exhaustive(&[ImageId(0), ImageId(2), ImageId(3)], &ids(4));
        assert_eq!(selection.pairs.len(), 3);
        assert_eq!(selection.isolated, vec![ImageId(1)]);
    }
}
