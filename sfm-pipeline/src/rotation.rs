//! In-plane rotation normalization.
//!
//! Upright descriptors fail when the same surface is photographed at very different camera
//! rolls. Images are therefore rotated by a quarter turn before extraction so that their bright
//! border, usually the sky, is at the top, and the keypoints are mapped back to the original
//! pixel frame afterwards. Matching and reconstruction only ever see original frame keypoints.

use crate::features::FeatureBackend;
use crate::{ExtractionError, RotationSettings};
use image::imageops;
use image::{GenericImageView, GrayImage};
use sfm_core::{ImageId, KeypointFrame, KeypointSet, QuarterTurn};

#[derive(Debug, Clone, PartialEq)]
pub struct RotationNormalizer {
    pub enabled: bool,
    pub settings: RotationSettings,
}

impl RotationNormalizer {
    pub fn new(enabled: bool, settings: RotationSettings) -> Self {
        Self { enabled, settings }
    }

    /// A normalizer which always uses the identity.
    pub fn disabled() -> Self {
        Self::new(false, Default::default())
    }

    /// The clockwise quarter turn that brings the image upright.
    ///
    /// Compares the mean intensity of the four border bands and turns the brightest one to the
    /// top. When no band stands out by `min_contrast` the image is assumed upright.
    pub fn estimate_rotation(&self, image: &GrayImage) -> QuarterTurn {
        if !self.enabled || image.width() < 2 || image.height() < 2 {
            return QuarterTurn::R0;
        }
        let (width, height) = image.dimensions();
        let band_w = ((width as f32 * self.settings.border_fraction) as u32).clamp(1, width);
        let band_h = ((height as f32 * self.settings.border_fraction) as u32).clamp(1, height);
        let mean = |x0: u32, y0: u32, w: u32, h: u32| {
            let view = imageops::crop_imm(image, x0, y0, w, h);
            let sum: u64 = view.pixels().map(|(_, _, p)| u64::from(p.0[0])).sum();
            sum as f32 / (u64::from(w) * u64::from(h)).max(1) as f32 / 255.0
        };
        // Ordered so ties resolve to the upright interpretation.
        let mut bands = [
            (mean(0, 0, width, band_h), QuarterTurn::R0),
            (mean(0, height - band_h, width, band_h), QuarterTurn::R180),
            (mean(0, 0, band_w, height), QuarterTurn::R90),
            (mean(width - band_w, 0, band_w, height), QuarterTurn::R270),
        ];
        bands.sort_by(|a, b| float_ord::FloatOrd(b.0).cmp(&float_ord::FloatOrd(a.0)));
        if bands[0].0 - bands[1].0 >= self.settings.min_contrast {
            bands[0].1
        } else {
            QuarterTurn::R0
        }
    }

    /// Extracts keypoints from the image turned upright and returns them in the original frame.
    pub fn extract(
        &self,
        backend: &dyn FeatureBackend,
        image: ImageId,
        pixels: &GrayImage,
        turn: QuarterTurn,
    ) -> Result<KeypointSet, ExtractionError> {
        if turn == QuarterTurn::R0 {
            return backend.extract(image, pixels);
        }
        let rotated = upright(turn, pixels);
        let mut set = backend.extract(image, &rotated)?;
        set.frame = KeypointFrame::Rotated {
            turn,
            width: rotated.width(),
            height: rotated.height(),
        };
        Ok(normalize(set))
    }
}

/// Rotates an image clockwise by `turn`.
pub fn upright(turn: QuarterTurn, image: &GrayImage) -> GrayImage {
    match turn {
        QuarterTurn::R0 => image.clone(),
        QuarterTurn::R90 => imageops::rotate90(image),
        QuarterTurn::R180 => imageops::rotate180(image),
        QuarterTurn::R270 => imageops::rotate270(image),
    }
}

/// Maps keypoints extracted from a rotated image back to the original frame.
///
/// Orientations are turned back as well. Sets already in the original frame are returned as is.
pub fn normalize(mut set: KeypointSet) -> KeypointSet {
    if let KeypointFrame::Rotated {
        turn,
        width,
        height,
    } = set.frame
    {
        let angle = turn.radians() as f32;
        for keypoint in &mut set.keypoints {
            keypoint.point.0 = turn.to_original(keypoint.point.0, width, height);
            if let Some(orientation) = keypoint.orientation.as_mut() {
                *orientation = (*orientation - angle).rem_euclid(std::f32::consts::TAU);
            }
        }
        set.frame = KeypointFrame::Original;
    }
    set
}
