mod common;

use image::{GrayImage, Luma};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use sfm_core::{BackendId, Correspondence, ImageId, PairKey, VerifiedPair};
use sfm_pipeline::fusion::fuse;
use sfm_pipeline::retrieval::rank;
use sfm_pipeline::{FeatureKey, FeatureStore, KeypointLayout, RotationNormalizer};
use std::collections::BTreeSet;

fn textured(seed: u64) -> GrayImage {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut image = GrayImage::from_fn(96, 80, |x, y| Luma([((x / 8 + y / 8) % 2 * 60 + 40) as u8]));
    for _ in 0..40 {
        let (cx, cy) = (rng.gen_range(8..88), rng.gen_range(8..72));
        let value = rng.gen_range(0..255u8);
        for y in cy - 3..cy + 3 {
            for x in cx - 3..cx + 3 {
                image.put_pixel(x, y, Luma([value]));
            }
        }
    }
    image
}

#[test]
fn extraction_is_deterministic() {
    let registry = common::registry();
    let names: Vec<String> = registry.names().map(str::to_string).collect();
    let backends = registry.resolve(&names).unwrap();
    let image = textured(3);
    for backend in backends {
        let first = backend.extract(ImageId(0), &image).unwrap();
        let second = backend.extract(ImageId(0), &image).unwrap();
        assert_eq!(first, second, "backend {} is not deterministic", backend.name());
    }
}

#[test]
fn rotated_extraction_is_deterministic_and_cached() {
    let registry = common::registry();
    let backend = registry.resolve(&["harris".to_string()]).unwrap().remove(0);
    let normalizer = RotationNormalizer::new(true, Default::default());
    let image = textured(4);
    let turn = sfm_core::QuarterTurn::R90;
    let dir = tempfile::tempdir().unwrap();
    let store = FeatureStore::new(dir.path(), 1);
    let key = FeatureKey {
        image_name: "a.png".to_string(),
        backend: backend.name().to_string(),
        config_hash: backend.config_hash(),
        turn,
    };
    let computed = store
        .get_or_compute(&key, ImageId(0), false, || {
            normalizer.extract(backend.as_ref(), ImageId(0), &image, turn)
        })
        .unwrap()
        .unwrap();
    let cached = store
        .get_or_compute(&key, ImageId(0), false, || panic!("recomputed"))
        .unwrap()
        .unwrap();
    assert_eq!(computed, cached);
    assert_eq!(
        normalizer.extract(backend.as_ref(), ImageId(0), &image, turn).unwrap(),
        computed
    );
}

#[test]
fn rank_is_sorted_for_random_inputs() {
    let mut rng = SmallRng::seed_from_u64(8);
    for _ in 0..200 {
        let dimension = rng.gen_range(1..5);
        let count = rng.gen_range(0..30);
        // Few distinct values so that ties are common.
        let mut all: Vec<(ImageId, Vec<f32>)> = (0..count)
            .map(|ix| {
                (
                    ImageId(ix),
                    (0..dimension).map(|_| rng.gen_range(-2..3) as f32).collect(),
                )
            })
            .collect();
        all.shuffle(&mut rng);
        let query: Vec<f32> = (0..dimension).map(|_| rng.gen_range(-2..3) as f32).collect();
        let k = rng.gen_range(0..35);

        let ranked = rank(&query, &all, k);
        assert_eq!(ranked.len(), k.min(all.len()));
        for w in ranked.windows(2) {
            assert!(w[0].1 > w[1].1 || (w[0].1 == w[1].1 && w[0].0 < w[1].0));
        }
        let ids: BTreeSet<ImageId> = ranked.iter().map(|r| r.0).collect();
        assert_eq!(ids.len(), ranked.len());
    }
}

fn correspondence(
    a: (u32, u32),
    b: (u32, u32),
    backend: u8,
    confidence: f32,
) -> Option<VerifiedPair> {
    let (a, b) = if a.0 < b.0 { (a, b) } else { (b, a) };
    Some(VerifiedPair {
        pair: PairKey::new(ImageId(a.0), ImageId(b.0))?,
        backend: BackendId(backend),
        putative: 1,
        correspondences: vec![Correspondence {
            image_a: ImageId(a.0),
            keypoint_a: a.1,
            image_b: ImageId(b.0),
            keypoint_b: b.1,
            backend: BackendId(backend),
            confidence,
        }],
    })
}

#[test]
fn fusion_never_repeats_an_image_in_a_track() {
    let mut rng = SmallRng::seed_from_u64(21);
    for round in 0..40 {
        let images = rng.gen_range(2..8);
        let keypoints = rng.gen_range(1..6);
        let mut verified: Vec<VerifiedPair> = (0..rng.gen_range(0..400))
            .filter_map(|_| {
                correspondence(
                    (rng.gen_range(0..images), rng.gen_range(0..keypoints)),
                    (rng.gen_range(0..images), rng.gen_range(0..keypoints)),
                    rng.gen_range(0..2),
                    // Equal confidences stress the tie breaking.
                    if round % 2 == 0 { 1.0 } else { rng.gen_range(0.0..1.0) },
                )
            })
            .collect();
        // Adversarial chains that walk back into their first image.
        for start in 0..keypoints {
            let chain: Vec<(u32, u32)> = (0..images).map(|image| (image, start)).collect();
            for w in chain.windows(2) {
                verified.extend(correspondence(w[0], w[1], 0, 0.9));
            }
            verified.extend(correspondence(
                chain[chain.len() - 1],
                (0, (start + 1) % keypoints),
                0,
                0.95,
            ));
        }

        let result = fuse(&verified, &KeypointLayout::default());
        let mut seen = BTreeSet::new();
        for track in &result.tracks {
            assert!(track.len() >= 2);
            let images: BTreeSet<ImageId> = track.images().collect();
            assert_eq!(images.len(), track.len(), "track {:?} repeats an image", track.id);
            for observation in &track.observations {
                assert!(seen.insert(*observation));
            }
        }

        verified.reverse();
        assert_eq!(fuse(&verified, &KeypointLayout::default()), result);
    }
}
