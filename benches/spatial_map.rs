// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Instant;

use spatial_detector::tracking::{OccupancyGrid, SpatialMap, TrackerParams};
use spatial_detector::{BBox, Detection, PinholeCamera, Position3D};

const CLASSES: [&str; 4] = ["person", "chair", "cup", "dog"];

fn frame_batch(n: usize, t: f64) -> (Vec<Detection>, Vec<Position3D>) {
    (0..n)
        .map(|i| {
            let det = Detection::new(
                BBox::new(0.0, 0.0, 50.0, 50.0),
                CLASSES[i % CLASSES.len()],
                0.8,
            );
            let x = (i as f64 * 0.37) % 4.0 - 2.0 + t * 0.01;
            let z = 0.5 + (i as f64 * 0.53) % 4.0;
            (det, Position3D::new(x, 0.0, z))
        })
        .unzip()
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_map_update");
    for n in [8usize, 32, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut map =
                SpatialMap::new(TrackerParams::default(), OccupancyGrid::new(5.0, 5.0, 0.1));
            let now = Instant::now();
            let mut t = 0.0;
            b.iter(|| {
                let (dets, positions) = frame_batch(n, t);
                t += 1.0;
                black_box(map.update_at(&dets, &positions, now));
            });
        });
    }
    group.finish();
}

fn bench_projection(c: &mut Criterion) {
    let camera = PinholeCamera::with_image_size(640, 480, 1000.0);
    c.bench_function("pixel_to_world", |b| {
        b.iter(|| {
            black_box(camera.pixel_to_world(
                black_box(150.0),
                black_box(150.0),
                black_box(0.4),
                true,
                5.0,
            ))
        })
    });
}

criterion_group!(benches, bench_update, bench_projection);
criterion_main!(benches);
