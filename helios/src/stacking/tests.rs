use glam::DVec2;

use super::*;
use crate::config::ReferenceSelection;
use crate::image::{ConsensusReference, EllipseFit};
use crate::testing::{SolarPattern, broadband_frame, init_tracing, named};

const SIZE: usize = 128;

fn constant(value: f32) -> Image {
    Image::mono(SIZE, SIZE, vec![value; SIZE * SIZE])
}

fn config(reference: ReferenceSelection) -> StackConfig {
    StackConfig {
        reference,
        ..Default::default()
    }
}

/// Mean absolute difference over the central region, `margin` pixels in.
fn interior_error(a: &Image, b: &Image, margin: usize) -> f64 {
    let (width, height) = a.dimensions();
    let mut sum = 0.0;
    let mut n = 0usize;
    for y in margin..height - margin {
        for x in margin..width - margin {
            sum += (a.get(x, y) - b.get(x, y)).abs() as f64;
            n += 1;
        }
    }
    sum / n as f64
}

fn with_maps(image: Image, displacement: DVec2) -> Image {
    let mut map = DistortionMap::new(SIZE, SIZE, 16, 32);
    for row in 0..map.rows() {
        for col in 0..map.cols() {
            map.set(col, row, displacement);
        }
    }
    image.with_metadata(DistortionMaps::new(vec![map]))
}

// =============================================================================
// Reference selection
// =============================================================================

#[test]
fn test_reference_first_average_median() {
    let images = vec![constant(1.0), constant(5.0), constant(3.0)];

    let first = choose_reference(&images, &config(ReferenceSelection::First)).unwrap();
    assert_eq!(first.image.get(7, 7), 1.0);
    assert_eq!(first.weights, vec![1.0; 3]);

    let average = choose_reference(&images, &config(ReferenceSelection::Average)).unwrap();
    assert!((average.image.get(7, 7) - 3.0).abs() < 1e-6);

    let median = choose_reference(&images, &config(ReferenceSelection::Median)).unwrap();
    assert_eq!(median.image.get(7, 7), 3.0);
}

#[test]
fn test_reference_lowest_eccentricity() {
    let images = vec![
        constant(1.0).with_metadata(EllipseFit { eccentricity: 0.5 }),
        constant(2.0),
        constant(3.0).with_metadata(EllipseFit { eccentricity: 0.2 }),
    ];
    let reference = choose_reference(&images, &config(ReferenceSelection::Eccentricity)).unwrap();
    assert_eq!(reference.image.get(0, 0), 3.0);

    // Frames without a fit count as 0.99.
    let images = vec![constant(1.0), constant(2.0).with_metadata(EllipseFit { eccentricity: 0.995 })];
    let reference = choose_reference(&images, &config(ReferenceSelection::Eccentricity)).unwrap();
    assert_eq!(reference.image.get(0, 0), 1.0);
}

#[test]
fn test_reference_sharpness_sets_weights() {
    let pattern = SolarPattern::new(1).shifted(SIZE, SIZE, DVec2::ZERO);
    let images = vec![constant(500.0), pattern.clone(), constant(400.0)];

    let reference = choose_reference(&images, &config(ReferenceSelection::Sharpness)).unwrap();
    assert_eq!(reference.image.id(), pattern.id());
    assert_eq!(reference.weights.len(), 3);
    assert_eq!(reference.weights[0], 0.0);
    assert!(reference.weights[1] > 0.0);
}

#[test]
fn test_reference_blank_frames_get_uniform_weights() {
    let images = vec![constant(0.0), constant(0.0)];
    let reference = choose_reference(&images, &config(ReferenceSelection::Sharpness)).unwrap();
    assert_eq!(reference.weights, vec![1.0, 1.0]);
}

#[test]
fn test_reference_manual() {
    let images = vec![named(constant(1.0), "a.fits"), named(constant(2.0), "b.fits")];

    let mut manual = config(ReferenceSelection::Manual);
    manual.manual_reference = Some("b.fits".into());
    let reference = choose_reference(&images, &manual).unwrap();
    assert_eq!(reference.image.file_name(), Some("b.fits"));

    manual.manual_reference = Some("missing.fits".into());
    assert!(matches!(
        choose_reference(&images, &manual),
        Err(Error::ManualReferenceNotFound(name)) if name == "missing.fits"
    ));

    // Unset falls back to sharpness.
    manual.manual_reference = None;
    let reference = choose_reference(&images, &manual).unwrap();
    assert_eq!(reference.weights.len(), 2);
}

#[test]
fn test_reference_consensus_is_tagged_copy() {
    let pattern = SolarPattern::new(2).shifted(SIZE, SIZE, DVec2::ZERO);
    let images = vec![constant(500.0), pattern];

    let reference = choose_reference(&images, &config(ReferenceSelection::Consensus)).unwrap();
    assert!(reference.image.metadata().contains::<ConsensusReference>());
    assert!(!images[1].metadata().contains::<ConsensusReference>());
    assert_eq!(reference.image.data(), images[1].data());
}

#[test]
fn test_reference_requires_images() {
    assert!(matches!(
        choose_reference(&[], &StackConfig::default()),
        Err(Error::EmptyImageList)
    ));
}

// =============================================================================
// stack / stack_onto
// =============================================================================

#[test]
fn test_stack_preconditions() {
    let images = vec![constant(1.0), Image::mono(64, 64, vec![0.0; 64 * 64])];
    assert!(matches!(
        stack(&images, &StackConfig::default(), &Progress::none()),
        Err(Error::DimensionMismatch { index: 1, .. })
    ));

    let bad = StackConfig {
        tile_size: 24,
        ..Default::default()
    };
    assert!(matches!(
        stack(&[constant(1.0)], &bad, &Progress::none()),
        Err(Error::InvalidTileSize(24))
    ));

    assert!(matches!(
        stack(&[], &StackConfig::default(), &Progress::none()),
        Err(Error::EmptyImageList)
    ));
}

#[test]
fn test_stack_single_image_unchanged() {
    let image = named(constant(3.0), "only.fits");
    let stacked = stack(std::slice::from_ref(&image), &StackConfig::default(), &Progress::none()).unwrap();
    assert_eq!(stacked.id(), image.id());
}

#[test]
fn test_stack_identical_frames() {
    init_tracing();
    let frame = SolarPattern::new(4).shifted(SIZE, SIZE, DVec2::ZERO);
    let images = vec![frame.clone(), frame.clone(), frame.clone()];

    let stacked = stack(&images, &config(ReferenceSelection::First), &Progress::none()).unwrap();
    assert_eq!(stacked.dimensions(), (SIZE, SIZE));
    assert!(interior_error(&stacked, &frame, 0) < 0.05);
}

#[test]
fn test_stack_aligns_shifted_frames() {
    init_tracing();
    let shifts = [DVec2::ZERO, DVec2::new(1.0, -0.5), DVec2::new(-0.75, 0.5)];
    let images: Vec<Image> = shifts
        .iter()
        .enumerate()
        .map(|(i, &s)| named(broadband_frame(SIZE, s, 6), &format!("f{i}.fits")))
        .collect();
    let reference = &images[0];

    let naive: Vec<f32> = (0..SIZE * SIZE)
        .map(|i| images.iter().map(|im| im.data()[i]).sum::<f32>() / 3.0)
        .collect();
    let naive = Image::mono(SIZE, SIZE, naive);

    let stacked = stack(&images, &config(ReferenceSelection::First), &Progress::none()).unwrap();
    let aligned = interior_error(&stacked, reference, 24);
    let unaligned = interior_error(&naive, reference, 24);
    assert!(
        aligned < unaligned / 2.0,
        "aligned error {aligned} vs naive {unaligned}"
    );
    assert_eq!(stacked.file_name(), Some("f0.fits"));
}

#[test]
fn test_stack_onto_identical_frames_keeps_border() {
    let frame = SolarPattern::new(4).shifted(SIZE, SIZE, DVec2::ZERO);
    let images = vec![frame.clone(), frame.clone()];

    let stacked = stack_onto(&images, &frame, &StackConfig::default(), &Progress::none()).unwrap();
    assert!(interior_error(&stacked, &frame, 0) < 0.05);
    for i in 0..SIZE {
        assert!((stacked.get(i, 0) - frame.get(i, 0)).abs() < 0.05, "row 0 at {i}");
        assert!((stacked.get(0, i) - frame.get(0, i)).abs() < 0.05, "column 0 at {i}");
    }
}

#[test]
fn test_stack_onto_suppresses_dissimilar_frame() {
    let frame = SolarPattern::new(8).shifted(SIZE, SIZE, DVec2::ZERO);
    let bright = frame.with_data(frame.data().iter().map(|v| v * 3.0).collect());
    let images = vec![frame.clone(), frame.clone(), bright];

    let stacked = stack_onto(&images, &frame, &StackConfig::default(), &Progress::none()).unwrap();
    let relative = interior_error(&stacked, &frame, 16) / 500.0;
    assert!(relative < 0.02, "relative error {relative}");
}

#[test]
fn test_stack_onto_checks_reference_dimensions() {
    let images = vec![constant(1.0), constant(2.0)];
    let small = Image::mono(64, 64, vec![1.0; 64 * 64]);
    assert!(matches!(
        stack_onto(&images, &small, &StackConfig::default(), &Progress::none()),
        Err(Error::DimensionMismatch { index: 2, .. })
    ));
}

#[test]
fn test_assemble_leaves_uncovered_pixels_zero() {
    let images = vec![constant(5.0), constant(7.0)];
    let mut away = DistortionMap::new(SIZE, SIZE, 16, 32);
    for row in 0..away.rows() {
        for col in 0..away.cols() {
            away.set(col, row, DVec2::new(1000.0, 0.0));
        }
    }
    let still = DistortionMap::new(SIZE, SIZE, 16, 32);

    let data = assemble(&images, &[away.clone(), away.clone()], &Weighting::Global(&[1.0, 1.0]), &Progress::none());
    assert!(data.iter().all(|&v| v == 0.0));

    let data = assemble(&images, &[away, still], &Weighting::Global(&[1.0, 1.0]), &Progress::none());
    assert!(data.iter().all(|&v| v == 7.0));
}

#[test]
fn test_assemble_keeps_border_under_subpixel_offsets() {
    let frame = SolarPattern::new(9).shifted(SIZE, SIZE, DVec2::ZERO);
    let images = vec![frame.clone(), frame.clone()];
    let mut map = DistortionMap::new(SIZE, SIZE, 16, 32);
    for row in 0..map.rows() {
        for col in 0..map.cols() {
            map.set(col, row, DVec2::new(-1e-6, 1e-6));
        }
    }
    let opposite = map.negate();

    let data = assemble(&images, &[map, opposite], &Weighting::Global(&[1.0, 1.0]), &Progress::none());
    for (i, (&out, &expected)) in data.iter().zip(frame.data()).enumerate() {
        assert!((out - expected).abs() < 1e-2, "pixel {i}: {out} vs {expected}");
    }
}

#[test]
fn test_similarity_weight() {
    assert!((similarity(10.0, 10.0) - 1.0).abs() < 1e-9);
    let far = similarity(100.0, 300.0);
    assert!((far - (-8.0f64 * 200.0 / 300.00001).exp()).abs() < 1e-9);
    assert!(similarity(0.0, 0.0) > 0.99);
}

#[test]
fn test_measure_displacements_records_zero_on_blank_reference() {
    let images = vec![constant(0.0), constant(0.0)];
    let maps = measure_displacements(&images, &images[0], &StackConfig::default(), &Progress::none());
    assert_eq!(maps.len(), 2);
    for map in &maps {
        assert!(map.total_distortion() < 1e-12);
    }
}

// =============================================================================
// stack_dedistorted
// =============================================================================

#[test]
fn test_dedistorted_requires_maps() {
    let images = vec![with_maps(constant(1.0), DVec2::ZERO), constant(2.0)];
    assert!(matches!(
        stack_dedistorted(&images, &StackDedistortedConfig::default(), &Progress::none()),
        Err(Error::MissingDistortionMaps { index: 1 })
    ));

    let empty = constant(2.0).with_metadata(DistortionMaps::default());
    let images = vec![with_maps(constant(1.0), DVec2::ZERO), empty];
    assert!(matches!(
        stack_dedistorted(&images, &StackDedistortedConfig::default(), &Progress::none()),
        Err(Error::MissingDistortionMaps { index: 1 })
    ));
}

#[test]
fn test_dedistorted_single_image_unchanged() {
    let image = constant(4.0);
    let stacked = stack_dedistorted(
        std::slice::from_ref(&image),
        &StackDedistortedConfig::default(),
        &Progress::none(),
    )
    .unwrap();
    assert_eq!(stacked.id(), image.id());
}

#[test]
fn test_dedistorted_global_weights_by_error() {
    let images = vec![
        with_maps(constant(10.0), DVec2::ZERO),
        with_maps(constant(20.0), DVec2::new(1.0, 0.0)),
    ];

    let stacked = stack_dedistorted(&images, &StackDedistortedConfig::default(), &Progress::none()).unwrap();
    let w = (-2.0f64).exp();
    let expected = (10.0 + 20.0 * w) / (1.0 + w);
    assert!((stacked.get(50, 50) as f64 - expected).abs() < 1e-4);
    assert!(stacked.metadata().contains::<DistortionMaps>());

    let best = StackDedistortedConfig {
        best_fraction: 0.5,
        ..Default::default()
    };
    let stacked = stack_dedistorted(&images, &best, &Progress::none()).unwrap();
    assert_eq!(stacked.get(50, 50), 10.0);
}

#[test]
fn test_dedistorted_zero_errors_average_uniformly() {
    let images = vec![
        with_maps(constant(10.0), DVec2::ZERO),
        with_maps(constant(20.0), DVec2::ZERO),
    ];
    let stacked = stack_dedistorted(&images, &StackDedistortedConfig::default(), &Progress::none()).unwrap();
    assert!((stacked.get(3, 3) - 15.0).abs() < 1e-5);
}

#[test]
fn test_dedistorted_local_prefers_low_error_sharp_frame() {
    let sharp = SolarPattern::new(12).shifted(SIZE, SIZE, DVec2::ZERO);
    let offset = sharp.with_data(sharp.data().iter().map(|v| v + 50.0).collect());
    let images = vec![
        with_maps(offset, DVec2::new(2.0, 0.0)),
        with_maps(sharp.clone(), DVec2::ZERO),
    ];
    let config = StackDedistortedConfig {
        best_fraction: 0.5,
        local_weights: true,
    };

    let stacked = stack_dedistorted(&images, &config, &Progress::none()).unwrap();
    assert_eq!(stacked.data(), sharp.data());
}

#[test]
fn test_dedistorted_local_uniform_fallback() {
    let a = SolarPattern::new(13).shifted(SIZE, SIZE, DVec2::ZERO);
    let b = a.with_data(a.data().iter().map(|v| v + 50.0).collect());
    let images = vec![with_maps(a.clone(), DVec2::ZERO), with_maps(b, DVec2::ZERO)];
    let config = StackDedistortedConfig {
        best_fraction: 1.0,
        local_weights: true,
    };

    let stacked = stack_dedistorted(&images, &config, &Progress::none()).unwrap();
    for i in (0..SIZE * SIZE).step_by(97) {
        assert!((stacked.data()[i] - (a.data()[i] + 25.0)).abs() < 1e-3);
    }
}
