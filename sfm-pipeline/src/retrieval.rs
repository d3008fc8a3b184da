//! Global image descriptors used to find overlapping views.

use crate::features::image::{gradients, GrayFloatImage};
use crate::{PipelineError, RetrievalSettings};
use float_ord::FloatOrd;
use image::imageops::{self, FilterType};
use image::GrayImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sfm_core::ImageId;
use std::fmt;
use std::str::FromStr;

/// The side length images are resized to before computing gradient grids.
const GRID_IMAGE_SIZE: u32 = 64;
const GRID_BINS: usize = 8;

/// The closed set of retrieval methods, selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalMethod {
    /// A zero mean thumbnail of the whole image.
    TinyImage,
    /// Histograms of gradient orientations over a coarse grid.
    GradientGrid,
}

impl RetrievalMethod {
    pub const ALL: [RetrievalMethod; 2] = [RetrievalMethod::TinyImage, RetrievalMethod::GradientGrid];

    pub fn name(self) -> &'static str {
        match self {
            Self::TinyImage => "tiny-image",
            Self::GradientGrid => "gradient-grid",
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RetrievalMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|method| method.name() == s)
            .ok_or_else(|| PipelineError::UnknownRetrieval(s.to_string()))
    }
}

/// The retrieval neighbors of one image, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub query: ImageId,
    pub neighbors: Vec<(ImageId, f32)>,
}

/// Embeds images into unit vectors whose dot product measures visual similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalIndex {
    pub method: RetrievalMethod,
    pub settings: RetrievalSettings,
}

impl RetrievalIndex {
    pub fn new(method: RetrievalMethod, settings: RetrievalSettings) -> Self {
        Self { method, settings }
    }

    /// The global descriptor of an image. Its length only depends on the settings.
    pub fn embed(&self, image: &GrayImage) -> Vec<f32> {
        let mut embedding = match self.method {
            RetrievalMethod::TinyImage => self.tiny_image(image),
            RetrievalMethod::GradientGrid => self.gradient_grid(image),
        };
        normalize(&mut embedding);
        embedding
    }

    /// Ranks the neighbors of every embedded image, excluding the image itself.
    pub fn rank_all(&self, embeddings: &[(ImageId, Vec<f32>)], k: usize) -> Vec<Ranking> {
        let mut rankings: Vec<Ranking> = embeddings
            .par_iter()
            .map(|(query, vector)| {
                // One extra neighbor makes room for the query itself.
                let neighbors = rank(vector, embeddings, k.saturating_add(1))
                    .into_iter()
                    .filter(|&(image, _)| image != *query)
                    .take(k)
                    .collect();
                Ranking {
                    query: *query,
                    neighbors,
                }
            })
            .collect();
        rankings.sort_by_key(|ranking| ranking.query);
        rankings
    }

    fn tiny_image(&self, image: &GrayImage) -> Vec<f32> {
        let side = self.settings.thumbnail_size.max(1);
        if image.width() == 0 || image.height() == 0 {
            return vec![0.0; (side * side) as usize];
        }
        let thumbnail = imageops::resize(image, side, side, FilterType::Triangle);
        let mut values: Vec<f32> = thumbnail.as_raw().iter().map(|&v| f32::from(v)).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        values.iter_mut().for_each(|v| *v -= mean);
        values
    }

    fn gradient_grid(&self, image: &GrayImage) -> Vec<f32> {
        let cells = self.settings.grid_cells.max(1) as usize;
        let mut histogram = vec![0f32; cells * cells * GRID_BINS];
        if image.width() == 0 || image.height() == 0 {
            return histogram;
        }
        let small = imageops::resize(image, GRID_IMAGE_SIZE, GRID_IMAGE_SIZE, FilterType::Triangle);
        let (gx, gy) = gradients(&GrayFloatImage::from_gray(&small));
        let side = GRID_IMAGE_SIZE as usize;
        for y in 0..side {
            for x in 0..side {
                let (dx, dy) = (gx.get(x, y), gy.get(x, y));
                let magnitude = (dx * dx + dy * dy).sqrt();
                if magnitude == 0.0 {
                    continue;
                }
                let angle = dy.atan2(dx).rem_euclid(std::f32::consts::TAU);
                let bin = ((angle / std::f32::consts::TAU * GRID_BINS as f32) as usize)
                    .min(GRID_BINS - 1);
                let cell = (y * cells / side) * cells + x * cells / side;
                histogram[cell * GRID_BINS + bin] += magnitude;
            }
        }
        histogram.iter_mut().for_each(|v| *v = v.sqrt());
        histogram
    }
}

fn normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-12 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Returns the `k` most similar vectors to `query` by dot product.
///
/// The search is exact and linear in the number of vectors, so ranking every image of a scene
/// is quadratic overall. The order is by descending score, ties broken by ascending image id.
pub fn rank(query: &[f32], all: &[(ImageId, Vec<f32>)], k: usize) -> Vec<(ImageId, f32)> {
    let mut scored: Vec<(ImageId, f32)> = all
        .iter()
        .map(|(image, vector)| {
            let score: f32 = query.iter().zip(vector).map(|(a, b)| a * b).sum();
            // NaN scores rank last instead of poisoning the order. Adding zero turns -0.0 into
            // 0.0 so that both tie on the image id.
            (*image, if score.is_nan() { f32::NEG_INFINITY } else { score + 0.0 })
        })
        .collect();
    scored.sort_by(|a, b| FloatOrd(b.1).cmp(&FloatOrd(a.1)).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_orders_by_score_then_id() {
        let all = vec![
            (ImageId(3), vec![1.0, 0.0]),
            (ImageId(1), vec![0.0, 1.0]),
            (ImageId(0), vec![1.0, 0.0]),
            (ImageId(2), vec![0.6, 0.8]),
        ];
        let ranked = rank(&[1.0, 0.0], &all, 3);
        assert_eq!(
            ranked.iter().map(|r| r.0).collect::<Vec<_>>(),
            vec![ImageId(0), ImageId(3), ImageId(2)]
        );
    }

    #[test]
    fn signed_zero_scores_tie_on_id() {
        let all = vec![(ImageId(0), vec![-2.0]), (ImageId(1), vec![3.0]), (ImageId(2), vec![1.0])];
        let ranked = rank(&[0.0], &all, 3);
        assert_eq!(
            ranked.iter().map(|r| r.0).collect::<Vec<_>>(),
            vec![ImageId(0), ImageId(1), ImageId(2)]
        );
        assert!(ranked.iter().all(|r| r.1.is_sign_positive()));
    }

    #[test]
    fn rank_all_excludes_the_query() {
        let index = RetrievalIndex::new(RetrievalMethod::TinyImage, Default::default());
        let embeddings = vec![
            (ImageId(0), vec![1.0, 0.0]),
            (ImageId(1), vec![0.8, 0.6]),
            (ImageId(2), vec![0.0, 1.0]),
        ];
        let rankings = index.rank_all(&embeddings, 5);
        assert_eq!(rankings.len(), 3);
        for ranking in &rankings {
            assert_eq!(ranking.neighbors.len(), 2);
            assert!(ranking.neighbors.iter().all(|&(id, _)| id != ranking.query));
        }
        assert_eq!(rankings[0].neighbors[0].0, ImageId(1));
    }

    #[test]
    fn embeddings_are_unit_length() {
        let image = GrayImage::from_fn(40, 30, |x, y| image::Luma([(x * 5 + y * 3) as u8]));
        for method in RetrievalMethod::ALL {
            let index = RetrievalIndex::new(method, Default::default());
            let embedding = index.embed(&image);
            let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "{} has norm {}", method, norm);
        }
    }

    #[test]
    fn parse_method_names() {
        assert_eq!("tiny-image".parse::<RetrievalMethod>().unwrap(), RetrievalMethod::TinyImage);
        assert!(matches!(
            "netvlad".parse::<RetrievalMethod>(),
            Err(PipelineError::UnknownRetrieval(_))
        ));
    }
}
