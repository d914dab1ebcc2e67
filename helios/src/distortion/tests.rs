use glam::DVec2;

use super::*;
use crate::error::Error;

fn constant(value: DVec2) -> DistortionMap {
    let mut map = DistortionMap::new(64, 64, 8, 32);
    for row in 0..map.rows() {
        for col in 0..map.cols() {
            map.set(col, row, value);
        }
    }
    map
}

fn linear(ax: f64, ay: f64) -> DistortionMap {
    let mut map = DistortionMap::new(64, 64, 8, 32);
    for row in 0..map.rows() {
        for col in 0..map.cols() {
            let p = map.cell_position(col, row);
            map.set(col, row, DVec2::new(ax * p.x, ay * p.y));
        }
    }
    map
}

#[test]
fn test_grid_dimensions() {
    let map = DistortionMap::new(100, 60, 16, 32);
    assert_eq!(map.cols(), (100 + 32) / 16 + 1);
    assert_eq!(map.rows(), (60 + 32) / 16 + 1);
    assert_eq!(map.total_distortion(), 0.0);
    assert_eq!(map.sampled_count(), 0);
}

#[test]
fn test_bicubic_hits_grid_nodes() {
    let map = linear(0.01, -0.02);
    for (col, row) in [(0, 0), (3, 5), (7, 2)] {
        let p = map.cell_position(col, row);
        let found = map.find_distortion(p.x, p.y);
        assert!((found - map.get(col, row)).length() < 1e-12);
    }
}

#[test]
fn test_bicubic_reproduces_linear_field_inside() {
    let map = linear(0.01, -0.02);
    for (x, y) in [(20.5, 30.25), (33.3, 17.9), (50.0, 41.0)] {
        let found = map.find_distortion(x, y);
        // LUT quantization of the fractional offset bounds the error.
        assert!((found.x - 0.01 * x).abs() < 2e-3, "{found:?}");
        assert!((found.y + 0.02 * y).abs() < 4e-3, "{found:?}");
    }
}

#[test]
fn test_lookup_outside_grid_is_zero() {
    let map = constant(DVec2::new(1.0, 1.0));
    assert_eq!(map.find_distortion(-1.0, 5.0), DVec2::ZERO);
    assert_eq!(map.find_distortion(5.0, 1e6), DVec2::ZERO);
    assert_eq!(map.find_distortion_nearest(-0.5, 0.0), DVec2::ZERO);
    assert_eq!(map.find_distortion_nearest(9.0, 13.0), DVec2::new(1.0, 1.0));
}

#[test]
fn test_nearest_lookup_rounds_to_cell() {
    let map = linear(1.0, 1.0);
    assert_eq!(map.find_distortion_nearest(11.0, 13.0), DVec2::new(8.0, 16.0));
}

#[test]
fn test_total_distortion_is_mean_magnitude() {
    let map = constant(DVec2::new(3.0, 4.0));
    assert!((map.total_distortion() - 5.0).abs() < 1e-12);
    assert!((map.negate().total_distortion() - 5.0).abs() < 1e-12);
    assert_eq!(map.negate().get(1, 1), DVec2::new(-3.0, -4.0));
}

#[test]
fn test_average_of_maps() {
    let a = constant(DVec2::new(1.0, 0.0));
    let b = constant(DVec2::new(0.0, 2.0));
    let c = constant(DVec2::new(-1.0, 1.0));
    let average = DistortionMap::average(&[&a, &b, &c]).unwrap();
    assert!((average.get(2, 2) - DVec2::new(0.0, 1.0)).length() < 1e-12);
    assert!(DistortionMap::average(&[]).is_none());
}

#[test]
fn test_average_resamples_other_grids() {
    let a = constant(DVec2::new(1.0, 1.0));
    let mut b = DistortionMap::new(64, 64, 16, 32);
    for row in 0..b.rows() {
        for col in 0..b.cols() {
            b.set(col, row, DVec2::new(3.0, 3.0));
        }
    }
    let average = DistortionMap::average(&[&a, &b]).unwrap();
    assert_eq!(average.step(), 8);
    assert!((average.get(3, 3) - DVec2::new(2.0, 2.0)).length() < 1e-9);
}

#[test]
fn test_append_composes_constant_maps() {
    let a = constant(DVec2::new(1.0, -0.5));
    let b = constant(DVec2::new(0.25, 2.0));
    let composed = a.append(&b);
    let v = composed.find_distortion(24.0, 24.0);
    assert!((v - DVec2::new(1.25, 1.5)).length() < 1e-9);
}

#[test]
fn test_append_follows_warp_order() {
    // first: d1(p) = 0.1 p.x in x; second: constant shift of 8 in x.
    let first = linear(0.1, 0.0);
    let second = constant(DVec2::new(8.0, 0.0));
    let composed = first.append(&second);
    // composed(p) = second(p) + first(p + second(p)) = 8 + 0.1 (x + 8).
    let v = composed.get(2, 2);
    assert!((v.x - (8.0 + 0.1 * 24.0)).abs() < 1e-6, "{v:?}");
}

#[test]
fn test_append_keeps_finer_grid() {
    let coarse = constant(DVec2::new(1.0, 0.0));
    let mut fine = DistortionMap::new(64, 64, 4, 16);
    for row in 0..fine.rows() {
        for col in 0..fine.cols() {
            fine.set(col, row, DVec2::new(0.0, 0.5));
        }
    }
    let composed = coarse.append(&fine);
    assert_eq!(composed.step(), 4);
    assert!((composed.get(5, 5) - DVec2::new(1.0, 0.5)).length() < 1e-9);
}

#[test]
fn test_synthesize_folds_in_order() {
    let maps = vec![
        constant(DVec2::new(1.0, 0.0)),
        constant(DVec2::new(0.0, 1.0)),
        constant(DVec2::new(0.5, 0.5)),
    ];
    let synthesized = DistortionMap::synthesize(&maps).unwrap();
    assert!((synthesized.get(3, 3) - DVec2::new(1.5, 1.5)).length() < 1e-9);
    assert!(DistortionMap::synthesize(&[]).is_none());
}

#[test]
fn test_record_places_nearest_cell() {
    let mut map = DistortionMap::new(64, 64, 8, 32);
    map.record(17.0, 30.0, DVec2::new(1.0, 2.0));
    map.record(-4.0, 0.0, DVec2::new(9.0, 9.0));
    map.record(1e6, 0.0, DVec2::new(9.0, 9.0));
    assert!(map.is_sampled(2, 4));
    assert_eq!(map.get(2, 4), DVec2::new(1.0, 2.0));
    assert_eq!(map.sampled_count(), 1);
}

#[test]
fn test_dense_field_layout() {
    let map = constant(DVec2::new(0.5, -1.5));
    let field = map.dense_field(4, 3);
    assert_eq!(field.len(), 4 * 3 * 2);
    assert!(field.chunks(2).all(|d| d == [0.5, -1.5]));
}

#[test]
fn test_map_bytes_roundtrip_and_layout() {
    let map = linear(0.3, -0.1);
    let bytes = map.to_bytes();
    assert_eq!(&bytes[0..4], &8i32.to_be_bytes());
    assert_eq!(&bytes[4..8], &32i32.to_be_bytes());
    assert_eq!(bytes.len(), 16 + map.cols() * map.rows() * 16);

    let back = DistortionMap::from_bytes(&bytes).unwrap();
    assert_eq!(back.values(), map.values());
    assert_eq!(back.step(), 8);
    assert_eq!(back.tile_size(), 32);
}

#[test]
fn test_malformed_map_bytes() {
    let bytes = constant(DVec2::ONE).to_bytes();
    assert!(matches!(
        DistortionMap::from_bytes(&bytes[..bytes.len() - 3]),
        Err(Error::MalformedDistortionMap(_))
    ));

    let mut extra = bytes.clone();
    extra.push(0);
    assert!(matches!(
        DistortionMap::from_bytes(&extra),
        Err(Error::MalformedDistortionMap(_))
    ));

    let mut zero_step = bytes;
    zero_step[0..4].copy_from_slice(&0i32.to_be_bytes());
    assert!(matches!(
        DistortionMap::from_bytes(&zero_step),
        Err(Error::MalformedDistortionMap(_))
    ));
}

#[test]
fn test_maps_bytes_roundtrip() {
    let maps = DistortionMaps::new(vec![constant(DVec2::X), linear(0.1, 0.2)]);
    let back = DistortionMaps::from_bytes(&maps.to_bytes()).unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back.maps()[1].values(), maps.maps()[1].values());

    let mut bad = maps.to_bytes();
    bad[0] = b'X';
    assert!(matches!(
        DistortionMaps::from_bytes(&bad),
        Err(Error::MalformedDistortionMap(_))
    ));
}

#[test]
fn test_maps_error_and_turbulence_scale() {
    let mut maps = DistortionMaps::default();
    assert_eq!(maps.error(), 0.0);

    maps.push(constant(DVec2::new(3.0, 4.0)));
    maps.push(constant(DVec2::new(0.0, 0.5)));
    assert!((maps.error() - 0.5).abs() < 1e-12);
    assert!((maps.interpolate_tile_error(20.0, 20.0) - 0.5).abs() < 1e-9);
    assert_eq!(maps.estimate_turbulence_scale(), 32);

    let small = DistortionMaps::new(vec![DistortionMap::new(64, 64, 8, 8)]);
    assert_eq!(small.estimate_turbulence_scale(), 16);
    let mixed = DistortionMaps::new(vec![
        DistortionMap::new(64, 64, 8, 64),
        DistortionMap::new(64, 64, 8, 32),
    ]);
    // Mean 48 rounds to 64 in log2.
    assert_eq!(mixed.estimate_turbulence_scale(), 64);
}
