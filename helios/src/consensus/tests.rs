use glam::DVec2;

use super::*;
use crate::config::GpuConfig;
use crate::testing::{SolarPattern, consensus_set, init_tracing, named};

const SHIFTS: [DVec2; 5] = [
    DVec2::new(0.0, 0.0),
    DVec2::new(2.0, -1.5),
    DVec2::new(-1.5, 1.0),
    DVec2::new(1.0, 2.5),
    DVec2::new(-2.5, -2.0),
];

/// Translation of output `image` relative to the base pattern, given the
/// frame's true shift.
fn effective_shift(image: &Image, shift: DVec2) -> DVec2 {
    let maps = image.metadata().get::<DistortionMaps>().unwrap();
    let (w, h) = image.dimensions();
    let correction = maps
        .synthesize()
        .map_or(DVec2::ZERO, |m| m.find_distortion(w as f64 / 2.0, h as f64 / 2.0));
    shift - correction
}

fn mean_pairwise(values: &[DVec2]) -> f64 {
    let mut sum = 0.0;
    let mut pairs = 0;
    for i in 0..values.len() {
        for j in i + 1..values.len() {
            sum += (values[i] - values[j]).length();
            pairs += 1;
        }
    }
    sum / pairs as f64
}

fn config(iterations: usize) -> ConsensusConfig {
    let mut config = ConsensusConfig::default();
    config.dedistort.iterations = iterations;
    config
}

#[test]
fn test_partners_full_set_when_small() {
    let config = ConsensusConfig::default();
    assert_eq!(partners(2, 5, 0, &config), vec![0, 1, 3, 4]);
    assert_eq!(partners(0, 31, 0, &config).len(), 30);
}

#[test]
fn test_partners_subsample_is_seeded() {
    let config = ConsensusConfig::default();
    let a = partners(3, 40, 1, &config);
    let b = partners(3, 40, 1, &config);
    assert_eq!(a, b);
    assert_eq!(a.len(), 30);
    assert!(!a.contains(&3));
    assert!(a.windows(2).all(|w| w[0] < w[1]));
    // Seed depends on the round.
    assert_ne!(a, partners(3, 40, 2, &config));
}

#[test]
fn test_directed_pairs_contain_both_directions() {
    let config = ConsensusConfig::default();
    let pairs = directed_pairs(4, 0, &config);
    assert_eq!(pairs.len(), 12);
    for &(i, j) in &pairs {
        assert_ne!(i, j);
        assert!(pairs.contains(&(j, i)));
    }
    assert_eq!(pairs, directed_pairs(4, 0, &config));
}

#[test]
fn test_directed_maps_are_antisymmetric() {
    let pattern = SolarPattern::new(21);
    let a = pattern.shifted(160, 160, DVec2::new(0.5, -1.0));
    let b = pattern.shifted(160, 160, DVec2::new(-1.0, 0.5));

    let config = crate::config::DedistortConfig::default();
    let detector = InterestPointDetector::new();
    let estimator = MapEstimator::new(&config, &detector);
    let forward = estimator.estimate(&a, &b).find_distortion(80.0, 80.0);
    let backward = estimator.estimate(&b, &a).find_distortion(80.0, 80.0);

    assert!((forward + backward).length() < 0.2, "{forward:?} {backward:?}");
    // i → j measures d_j - d_i, attenuated by the correlator.
    let expected = DVec2::new(-1.5, 1.5);
    assert!(forward.dot(expected) > 0.7 * expected.length_squared());
}

#[test]
fn test_requires_keyframe() {
    let images: Vec<Image> = (0..3)
        .map(|i| named(SolarPattern::new(1).shifted(64, 64, DVec2::ZERO), &format!("{i}.fits")))
        .collect();
    assert!(matches!(
        dedistort_consensus(&images, &config(1), None, &Progress::none()),
        Err(Error::MissingConsensusKeyframe)
    ));
    assert!(matches!(
        dedistort_consensus(&[], &config(1), None, &Progress::none()),
        Err(Error::EmptyImageList)
    ));
}

#[test]
fn test_single_image_is_returned_unchanged() {
    let images = consensus_set(64, &[DVec2::ZERO], 3);
    let result = dedistort_consensus(&images, &config(3), None, &Progress::none()).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].data(), images[0].data());
    assert!(result[0].metadata().get::<DistortionMaps>().is_none());
}

#[test]
fn test_scenario_reduces_pairwise_residual() {
    init_tracing();
    let images = consensus_set(256, &SHIFTS, 42);
    let before = mean_pairwise(&SHIFTS);

    let result = dedistort_consensus(&images, &config(3), None, &Progress::none()).unwrap();
    assert_eq!(result.len(), 5);
    let effective: Vec<DVec2> = result
        .iter()
        .zip(SHIFTS)
        .map(|(image, shift)| effective_shift(image, shift))
        .collect();
    let after = mean_pairwise(&effective);
    assert!(after < 0.2, "mean pairwise residual {after} (was {before})");
}

#[test]
fn test_result_in_input_order_and_deterministic() {
    let images = consensus_set(128, &SHIFTS[..4], 7);
    let mut shuffled = images.clone();
    shuffled.swap(0, 3);
    shuffled.swap(1, 2);

    let a = dedistort_consensus(&images, &config(2), None, &Progress::none()).unwrap();
    let b = dedistort_consensus(&shuffled, &config(2), None, &Progress::none()).unwrap();
    for (image, input) in a.iter().zip(&images) {
        assert_eq!(image.file_name(), input.file_name());
    }
    for image in &a {
        let other = b
            .iter()
            .find(|o| o.file_name() == image.file_name())
            .unwrap();
        assert_eq!(image.data(), other.data());
    }
}

#[test]
fn test_resident_device_matches_cpu() {
    let images = consensus_set(128, &SHIFTS[..4], 9);
    let context = GpuContext::host(GpuConfig {
        min_tiles_for_gpu: 10,
        ..GpuConfig::default()
    });

    let cpu = dedistort_consensus(&images, &config(2), None, &Progress::none()).unwrap();
    let gpu = dedistort_consensus(&images, &config(2), Some(&context), &Progress::none()).unwrap();
    for (c, g) in cpu.iter().zip(&gpu) {
        assert_eq!(c.data(), g.data());
    }
}

#[test]
fn test_per_round_cache_matches_cpu() {
    let images = consensus_set(128, &SHIFTS[..4], 10);
    // Room for two 128² images next to the kernel reserve, not four.
    let context = GpuContext::host(GpuConfig {
        device_memory: 400_000,
        min_tiles_for_gpu: 10,
        budget_tiles: 1,
        ..GpuConfig::default()
    });
    assert_eq!(context.memory_budget(128, 128, 32).max_resident_images, 2);

    let cpu = dedistort_consensus(&images, &config(1), None, &Progress::none()).unwrap();
    let gpu = dedistort_consensus(&images, &config(1), Some(&context), &Progress::none()).unwrap();
    for (c, g) in cpu.iter().zip(&gpu) {
        assert_eq!(c.data(), g.data());
    }
}
