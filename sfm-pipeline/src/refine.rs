//! Memory gated refinement of a finished reconstruction.

use crate::{RefinementMode, RefinementSettings, SceneWarning};
use log::*;
use serde::{Deserialize, Serialize};
use sfm_core::{ImageId, Reconstruction, TrackId};
use sfm_geom::{BundleAdjustScope, BundleAdjuster};
use std::collections::BTreeSet;

const MEGABYTE: u64 = 1024 * 1024;

/// How refinement ran for a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementOutcome {
    Full,
    Reduced,
    Skipped,
}

/// The decision of [`plan`] along with the warning explaining a downgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementPlan {
    pub outcome: RefinementOutcome,
    pub estimated_mb: u64,
    pub warning: Option<SceneWarning>,
}

/// Decides how to refine a reconstruction of `images` images and `observations` observations.
///
/// Scenes with more images than `threshold` are not refined at all. Otherwise the working set is
/// estimated from the observation count and a full refinement over the memory budget is reduced.
pub fn plan(
    images: usize,
    observations: usize,
    threshold: usize,
    settings: &RefinementSettings,
) -> RefinementPlan {
    let estimated_mb =
        (observations as u64 * settings.bytes_per_observation + MEGABYTE - 1) / MEGABYTE;
    let exceeded = |outcome| {
        Some(SceneWarning::RefinementBudgetExceeded {
            images,
            threshold,
            estimated_mb,
            budget_mb: settings.memory_budget_mb,
            outcome,
        })
    };
    let (outcome, warning) = if images > threshold {
        (RefinementOutcome::Skipped, exceeded(RefinementOutcome::Skipped))
    } else {
        match settings.mode {
            RefinementMode::Reduced => (RefinementOutcome::Reduced, None),
            RefinementMode::Full if estimated_mb > settings.memory_budget_mb => {
                (RefinementOutcome::Reduced, exceeded(RefinementOutcome::Reduced))
            }
            RefinementMode::Full => (RefinementOutcome::Full, None),
        }
    };
    RefinementPlan {
        outcome,
        estimated_mb,
        warning,
    }
}

/// Refines the reconstruction in place as decided by `outcome`.
///
/// The registered camera with the smallest id is held fixed. The reduced mode only optimizes the
/// longest tracks and runs fewer rounds.
pub fn refine(
    reconstruction: &mut Reconstruction,
    outcome: RefinementOutcome,
    settings: &RefinementSettings,
    loss_cutoff: f64,
) {
    let rounds = match outcome {
        RefinementOutcome::Skipped => return,
        RefinementOutcome::Full => settings.full_rounds,
        RefinementOutcome::Reduced => settings.reduced_rounds,
    };
    let fixed: BTreeSet<ImageId> = reconstruction.cameras.keys().take(1).copied().collect();
    let tracks: Option<BTreeSet<TrackId>> = (outcome == RefinementOutcome::Reduced).then(|| {
        let mut by_length: Vec<(usize, TrackId)> = reconstruction
            .points
            .iter()
            .map(|(&track, point)| (point.observations.len(), track))
            .collect();
        by_length.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        by_length
            .into_iter()
            .take(settings.reduced_track_cap)
            .map(|(_, track)| track)
            .collect()
    });

    let before = reconstruction.mean_reprojection_error();
    BundleAdjuster::new()
        .iterations(settings.iterations)
        .loss_cutoff(loss_cutoff)
        .bundle_adjust(
            reconstruction,
            rounds,
            BundleAdjustScope {
                fixed_cameras: Some(&fixed),
                tracks: tracks.as_ref(),
            },
        );
    info!(
        "{:?} refinement of {} cameras and {} points: mean reprojection error {:.3} -> {:.3}",
        outcome,
        reconstruction.registered_count(),
        reconstruction.points.len(),
        before,
        reconstruction.mean_reprojection_error()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_threshold_is_skipped() {
        let plan = plan(100, 1000, 50, &RefinementSettings::default());
        assert_eq!(plan.outcome, RefinementOutcome::Skipped);
        assert!(matches!(
            plan.warning,
            Some(SceneWarning::RefinementBudgetExceeded {
                outcome: RefinementOutcome::Skipped,
                images: 100,
                threshold: 50,
                ..
            })
        ));
    }

    #[test]
    fn over_budget_is_reduced() {
        let settings = RefinementSettings {
            memory_budget_mb: 1,
            bytes_per_observation: 1024,
            ..Default::default()
        };
        let plan = plan(10, 4096, 50, &settings);
        assert_eq!(plan.estimated_mb, 4);
        assert_eq!(plan.outcome, RefinementOutcome::Reduced);
        assert!(plan.warning.is_some());
    }

    #[test]
    fn within_budget_is_full() {
        let plan = plan(10, 4096, 10, &RefinementSettings::default());
        assert_eq!(plan.outcome, RefinementOutcome::Full);
        assert!(plan.warning.is_none());
    }

    #[test]
    fn skipped_leaves_reconstruction_untouched() {
        let mut reconstruction = Reconstruction::default();
        let before = reconstruction.clone();
        refine(
            &mut reconstruction,
            RefinementOutcome::Skipped,
            &Default::default(),
            2.0,
        );
        assert_eq!(reconstruction, before);
    }
}
