//! Descriptor matching and geometric verification of candidate pairs.

use crate::features::SceneFeatures;
use crate::{MatcherSettings, SceneWarning, VerificationModel};
use arrsac::Arrsac;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use sample_consensus::{Consensus, Estimator};
use serde::{Deserialize, Serialize};
use sfm_core::space::{Knn, LinearKnn};
use sfm_core::{
    bitarray::Hamming, BackendId, CandidatePair, Correspondence, Descriptors, Euclidean, ImageInfo, KeypointSet,
    PairKey, VerifiedPair,
};
use sfm_geom::{FourPoint, NormalizedEightPoint, PixelMatch};

/// A putative match: keypoint indices into both sets and the confidence of the match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PutativeMatch {
    pub a: usize,
    pub b: usize,
    pub confidence: f32,
}

/// The result of matching every candidate pair with every backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchReport {
    /// Pairs with enough verified correspondences, sorted by pair key then backend.
    pub verified: Vec<VerifiedPair>,
    /// Candidate pairs no backend produced enough correspondences for, sorted.
    pub dropped: Vec<PairKey>,
    pub warnings: Vec<SceneWarning>,
}

/// Matches keypoint sets by mutual nearest neighbors with a ratio test and keeps the matches
/// consistent with a geometric model found by ARRSAC.
///
/// Every (pair, backend) job seeds its own generator from the base seed, the pair and the
/// backend. The outcome is therefore reproducible regardless of how jobs are scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    pub settings: MatcherSettings,
    pub seed: u64,
}

impl Matcher {
    pub fn new(settings: MatcherSettings, seed: u64) -> Self {
        Self { settings, seed }
    }

    /// The best match in `to` of every descriptor in `from` that passes the ratio test.
    fn one_way(&self, from: &KeypointSet, to: &KeypointSet) -> Vec<Option<(usize, f32)>> {
        match (&from.descriptors, &to.descriptors) {
            (Descriptors::Float { data: queries, .. }, Descriptors::Float { data, .. }) => {
                let knn = LinearKnn {
                    metric: Euclidean,
                    iter: data.iter(),
                };
                queries
                    .iter()
                    .map(|query| {
                        let nearest = knn.knn(query, 2);
                        self.ratio_test(nearest.into_iter().map(|n| (n.index, Euclidean::value(n.distance))))
                    })
                    .collect()
            }
            (Descriptors::Binary(queries), Descriptors::Binary(data)) => {
                let knn = LinearKnn {
                    metric: Hamming,
                    iter: data.iter(),
                };
                queries
                    .iter()
                    .map(|query| {
                        let nearest = knn.knn(query, 2);
                        self.ratio_test(nearest.into_iter().map(|n| (n.index, n.distance as f32)))
                    })
                    .collect()
            }
            _ => vec![None; from.len()],
        }
    }

    /// Accepts the nearest neighbor when it is clearly closer than the second nearest.
    fn ratio_test(&self, mut nearest: impl Iterator<Item = (usize, f32)>) -> Option<(usize, f32)> {
        let (best, distance) = nearest.next()?;
        let second = nearest.next().map_or(f32::INFINITY, |(_, distance)| distance);
        if distance >= self.settings.ratio * second {
            return None;
        }
        let confidence = if second.is_finite() && second > 0.0 {
            1.0 - distance / second
        } else {
            1.0
        };
        Some((best, confidence))
    }

    /// Mutual nearest neighbor matches passing the ratio test in both directions, sorted by the
    /// keypoint index in `a`.
    pub fn putative(&self, a: &KeypointSet, b: &KeypointSet) -> Vec<PutativeMatch> {
        if a.is_empty() || b.is_empty() || !a.descriptors.compatible(&b.descriptors) {
            return vec![];
        }
        let forward = self.one_way(a, b);
        let reverse = self.one_way(b, a);
        forward
            .into_iter()
            .enumerate()
            .filter_map(|(aix, matched)| {
                let (bix, confidence) = matched?;
                let (back, reverse_confidence) = reverse[bix]?;
                (back == aix).then(|| PutativeMatch {
                    a: aix,
                    b: bix,
                    confidence: confidence.min(reverse_confidence),
                })
            })
            .collect()
    }

    /// Keeps the putative matches that are inliers of the verification model.
    ///
    /// Returns an empty list when there are too few matches to estimate the model.
    pub fn verify(
        &self,
        pair: PairKey,
        backend: BackendId,
        a: &KeypointSet,
        b: &KeypointSet,
        putative: &[PutativeMatch],
    ) -> Vec<Correspondence> {
        let data: Vec<PixelMatch> = putative
            .iter()
            .map(|m| PixelMatch(a.keypoint(m.a).0, b.keypoint(m.b).0))
            .collect();
        let rng = Xoshiro256PlusPlus::seed_from_u64(
            self.seed ^ pair.stable_hash() ^ u64::from(backend.0).rotate_left(56),
        );
        let inliers = match self.settings.model {
            VerificationModel::Fundamental => {
                self.consensus_inliers(&NormalizedEightPoint::new(), &data, rng)
            }
            VerificationModel::Homography => self.consensus_inliers(&FourPoint::new(), &data, rng),
        };
        inliers
            .into_iter()
            .map(|ix| {
                let m = putative[ix];
                Correspondence {
                    image_a: pair.first(),
                    keypoint_a: m.a as u32,
                    image_b: pair.second(),
                    keypoint_b: m.b as u32,
                    backend,
                    confidence: m.confidence,
                }
            })
            .collect()
    }

    fn consensus_inliers<E>(&self, estimator: &E, data: &[PixelMatch], rng: Xoshiro256PlusPlus) -> Vec<usize>
    where
        E: Estimator<PixelMatch>,
    {
        if data.len() < E::MIN_SAMPLES.max(self.settings.min_correspondences) {
            return vec![];
        }
        let mut arrsac = Arrsac::new(self.settings.inlier_threshold, rng);
        arrsac
            .model_inliers(estimator, data.iter().copied())
            .map(|(_, mut inliers)| {
                inliers.sort_unstable();
                inliers
            })
            .unwrap_or_default()
    }

    /// Matches the first image of `pair` against the second with one backend.
    pub fn match_pair(&self, pair: PairKey, backend: BackendId, a: &KeypointSet, b: &KeypointSet) -> VerifiedPair {
        let putative = self.putative(a, b);
        let correspondences = self.verify(pair, backend, a, b, &putative);
        VerifiedPair {
            pair,
            backend,
            putative: putative.len(),
            correspondences,
        }
    }

    /// Runs every (pair, backend) job on the current thread pool.
    ///
    /// Jobs where one of the images has no keypoints for the backend are skipped. The image
    /// already carries a warning from extraction. Weak pairs are returned as warnings in the
    /// report and left to the caller to log.
    pub fn match_all(
        &self,
        pairs: &[CandidatePair],
        features: &SceneFeatures,
        images: &[ImageInfo],
        backend_names: &[String],
    ) -> MatchReport {
        let jobs: Vec<(PairKey, BackendId)> = pairs
            .iter()
            .flat_map(|pair| (0..features.backends()).map(move |b| (pair.key, BackendId(b as u8))))
            .collect();
        let mut results: Vec<(PairKey, BackendId, Option<VerifiedPair>)> = jobs
            .par_iter()
            .map(|&(pair, backend)| {
                let sets = features
                    .get(backend, pair.first())
                    .zip(features.get(backend, pair.second()));
                (pair, backend, sets.map(|(a, b)| self.match_pair(pair, backend, a, b)))
            })
            .collect();
        results.sort_by_key(|&(pair, backend, _)| (pair, backend));

        let name = |image: sfm_core::ImageId| {
            images
                .get(image.index())
                .map_or_else(|| image.to_string(), |info| info.name.clone())
        };
        let mut report = MatchReport::default();
        for (pair, backend, verified) in results {
            let verified = match verified {
                Some(verified) => verified,
                None => {
                    debug!("skipping {:?} for backend {}: missing keypoints", pair, backend);
                    continue;
                }
            };
            if verified.correspondences.len() >= self.settings.min_correspondences {
                debug!(
                    "{:?} backend {}: {} of {} putative matches verified",
                    pair,
                    backend,
                    verified.correspondences.len(),
                    verified.putative
                );
                report.verified.push(verified);
            } else {
                let warning = SceneWarning::MatchInsufficientCorrespondences {
                    image_a: name(pair.first()),
                    image_b: name(pair.second()),
                    backend: backend_names
                        .get(backend.index())
                        .cloned()
                        .unwrap_or_else(|| backend.to_string()),
                    verified: verified.correspondences.len(),
                    required: self.settings.min_correspondences,
                };
                report.warnings.push(warning);
            }
        }
        report.dropped = pairs
            .iter()
            .map(|pair| pair.key)
            .filter(|key| report.verified.binary_search_by_key(key, |v| v.pair).is_err())
            .collect();
        report.dropped.sort();
        report
    }
}
