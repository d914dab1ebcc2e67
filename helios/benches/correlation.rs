//! Run with: cargo bench --package helios --bench correlation

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use helios::{DedistortConfig, Image, InterestPointDetector, MapEstimator, TileCorrelator};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Sum of random plane waves, translated by `(dx, dy)`.
fn texture(width: usize, height: usize, dx: f64, dy: f64, seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let waves: Vec<(f64, f64, f64)> = (0..24)
        .map(|_| {
            let wavelength: f64 = rng.random_range(6.0..24.0);
            let angle: f64 = rng.random_range(0.0..std::f64::consts::PI);
            let k = std::f64::consts::TAU / wavelength;
            (k * angle.cos(), k * angle.sin(), rng.random_range(0.0..std::f64::consts::TAU))
        })
        .collect();
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let (px, py) = (x as f64 - dx, y as f64 - dy);
            let v: f64 = waves.iter().map(|(kx, ky, p)| 20.0 * (kx * px + ky * py + p).cos()).sum();
            data.push((500.0 + v) as f32);
        }
    }
    data
}

fn tile_correlation(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_correlation");
    let correlator = TileCorrelator::default();
    for size in [32usize, 64, 128] {
        let reference = texture(size, size, 0.0, 0.0, 7);
        let target = texture(size, size, 1.3, -0.6, 7);
        group.bench_with_input(BenchmarkId::new("phase", size), &size, |b, &size| {
            b.iter(|| correlator.correlate(black_box(&reference), black_box(&target), size))
        });
        group.bench_with_input(BenchmarkId::new("ncc", size), &size, |b, &size| {
            b.iter(|| correlator.ncc(black_box(&reference), black_box(&target), size))
        });
    }
    group.finish();
}

fn map_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_estimation");
    group.sample_size(10);
    let size = 512;
    let reference = Image::mono(size, size, texture(size, size, 0.0, 0.0, 11));
    let target = Image::mono(size, size, texture(size, size, 0.8, 1.1, 11));
    let detector = InterestPointDetector::new();

    for (name, config) in [
        ("grid", DedistortConfig::default()),
        ("sparse", DedistortConfig::default().with_sparse(true, false)),
        ("refine", DedistortConfig { refine: true, tile_size: 64, ..Default::default() }),
    ] {
        let estimator = MapEstimator::new(&config, &detector);
        group.bench_function(name, |b| {
            b.iter(|| {
                detector.clear();
                estimator.estimate(black_box(&reference), black_box(&target))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, tile_correlation, map_estimation);
criterion_main!(benches);
