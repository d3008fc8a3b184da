use rand::{rngs::SmallRng, Rng, SeedableRng};
use sfm_core::nalgebra::{Point2, Point3, Rotation3, Vector3};
use sfm_core::{CameraIntrinsics, CameraToCamera, Pose};
use sfm_geom::sample_consensus::Model;
use sfm_geom::{EightPoint, NormalizedEightPoint, NormalizedMatch, PixelMatch};

const SAMPLE_POINTS: usize = 16;
const RESIDUAL_THRESHOLD: f64 = 1e-4;
const PIXEL_RESIDUAL_THRESHOLD: f64 = 1e-3;

const ROT_MAGNITUDE: f64 = 0.2;
const POINT_BOX_SIZE: f64 = 2.0;
const POINT_DISTANCE: f64 = 3.0;

#[test]
fn randomized_essential() {
    let mut rng = SmallRng::seed_from_u64(0);
    let successes = (0..500).filter(|_| run_essential_round(&mut rng)).count();
    eprintln!("successes: {}", successes);
    assert!(successes > 475);
}

#[test]
fn randomized_fundamental() {
    let mut rng = SmallRng::seed_from_u64(1);
    let successes = (0..500).filter(|_| run_fundamental_round(&mut rng)).count();
    eprintln!("successes: {}", successes);
    assert!(successes > 475);
}

fn run_essential_round(rng: &mut SmallRng) -> bool {
    let matches = some_test_data(rng);
    let essential = match EightPoint::new().from_matches(matches.iter().copied()) {
        Some(essential) => essential,
        None => return false,
    };
    matches.iter().all(|m| {
        let residual = essential.residual(m).abs();
        if residual > RESIDUAL_THRESHOLD {
            eprintln!("failed residual check: {}", residual);
        }
        residual <= RESIDUAL_THRESHOLD
    })
}

fn run_fundamental_round(rng: &mut SmallRng) -> bool {
    let intrinsics = CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0);
    let matches: Vec<PixelMatch> = some_test_data(rng)
        .into_iter()
        .map(|NormalizedMatch(a, b)| {
            PixelMatch(
                intrinsics.uncalibrate(a).0,
                intrinsics.uncalibrate(b).0,
            )
        })
        .collect();
    let fundamental = match NormalizedEightPoint::new().from_matches(matches.iter().copied()) {
        Some(fundamental) => fundamental,
        None => return false,
    };
    matches.iter().all(|m| {
        let residual = fundamental.residual(m).abs();
        if residual > PIXEL_RESIDUAL_THRESHOLD {
            eprintln!("failed residual check: {}", residual);
        }
        residual <= PIXEL_RESIDUAL_THRESHOLD
    })
}

/// Gets normalized matches between two cameras with a random relative pose.
fn some_test_data(rng: &mut SmallRng) -> Vec<NormalizedMatch> {
    let mut random_vector = || Vector3::new(rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>());
    let translation = random_vector() - Vector3::repeat(0.5);
    let rotation = Rotation3::new(
        (random_vector() - Vector3::repeat(0.5)) * std::f64::consts::PI * 2.0 * ROT_MAGNITUDE,
    );
    let relative_pose = CameraToCamera::from_parts(translation, rotation);

    (0..SAMPLE_POINTS)
        .map(|_| {
            let mut a = Point3::from(random_vector() * POINT_BOX_SIZE);
            a.x -= 0.5 * POINT_BOX_SIZE;
            a.y -= 0.5 * POINT_BOX_SIZE;
            a.z += POINT_DISTANCE;
            let b = relative_pose.transform(a);
            NormalizedMatch(
                Point2::new(a.x / a.z, a.y / a.z),
                Point2::new(b.x / b.z, b.y / b.z),
            )
        })
        .collect()
}
