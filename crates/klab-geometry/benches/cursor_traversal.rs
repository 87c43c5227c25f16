// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use klab_geometry::{Cursor, Geometry, SpaceFillingCurve};

fn bench_cursors(c: &mut Criterion) {
    let geometry = Geometry::grid(256, 256).unwrap();

    for curve in [SpaceFillingCurve::D2Xy, SpaceFillingCurve::D2Hilbert] {
        c.bench_function(&format!("traverse_256x256_{}", curve), |b| {
            b.iter(|| {
                let cursor = Cursor::new(&geometry, curve).unwrap();
                black_box(cursor.sum::<u64>())
            })
        });
    }

    c.bench_function("remap_256x256_hilbert_to_xy", |b| {
        b.iter(|| {
            let cursor =
                Cursor::remapping(&geometry, SpaceFillingCurve::D2Hilbert, SpaceFillingCurve::D2Xy).unwrap();
            black_box(cursor.sum::<u64>())
        })
    });
}

criterion_group!(benches, bench_cursors);
criterion_main!(benches);
