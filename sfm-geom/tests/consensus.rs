use approx::assert_relative_eq;
use arrsac::Arrsac;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use sfm_core::nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};
use sfm_core::{Pose, WorldToCamera};
use sfm_geom::sample_consensus::Consensus;
use sfm_geom::{DltResection, FourPoint, Homography, PixelMatch, WorldMatch};

const EPSILON_APPROX: f64 = 1e-6;

#[test]
fn arrsac_resection() {
    let mut arrsac = Arrsac::new(0.01, SmallRng::seed_from_u64(0));
    let mut rng = SmallRng::seed_from_u64(7);

    // Define the camera pose.
    let rot = Rotation3::from_euler_angles(0.1, 0.2, 0.3);
    let trans = Vector3::new(0.1, 0.2, 0.3);
    let pose = WorldToCamera::from_parts(trans, rot);

    // Points in front of the camera, a few of them with corrupted observations.
    let mut samples: Vec<WorldMatch> = (0..40)
        .map(|_| {
            let camera = Point3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(2.0..4.0),
            );
            let world = pose.0.inverse() * camera;
            WorldMatch(Point2::new(camera.x / camera.z, camera.y / camera.z), world)
        })
        .collect();
    for sample in samples.iter_mut().step_by(8) {
        sample.0 += Point2::new(0.3, -0.2).coords;
    }

    let (estimate, inliers) = arrsac
        .model_inliers(&DltResection::new(), samples.iter().copied())
        .unwrap();

    // Compare the pose to ground truth.
    assert_relative_eq!(rot, estimate.0.rotation, epsilon = EPSILON_APPROX);
    assert_relative_eq!(trans, estimate.0.translation.vector, epsilon = EPSILON_APPROX);
    assert_eq!(inliers.len(), 35);
}

#[test]
fn arrsac_homography_rejects_outliers() {
    let mut arrsac = Arrsac::new(1.0, SmallRng::seed_from_u64(0));
    let mut rng = SmallRng::seed_from_u64(3);
    let truth = Homography::new(Matrix3::new(
        0.98, 0.04, 15.0, -0.02, 1.01, -8.0, 5e-5, -3e-5, 1.0,
    ))
    .unwrap();

    let samples: Vec<PixelMatch> = (0..60)
        .map(|ix| {
            let a = Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0));
            let b = if ix % 5 == 0 {
                Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0))
            } else {
                truth.transfer(a).unwrap()
            };
            PixelMatch(a, b)
        })
        .collect();

    let (estimate, inliers) = arrsac
        .model_inliers(&FourPoint::new(), samples.iter().copied())
        .unwrap();

    assert!(inliers.len() >= 48);
    for &ix in &inliers {
        assert!(ix % 5 != 0 || estimate.symmetric_transfer_error(&samples[ix]) < 1.0);
    }
    let probe = Point2::new(320.0, 240.0);
    assert_relative_eq!(
        estimate.transfer(probe).unwrap(),
        truth.transfer(probe).unwrap(),
        epsilon = 1e-3
    );
}
