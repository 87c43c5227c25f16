// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for storages, buffers and the storage manager
//!
//! Every test opens its own manager on a fresh temporary scratch directory.

use std::sync::Arc;

use klab_config::StorageConfig;
use klab_geometry::{Dimension, Geometry, GeometryError, SpaceFillingCurve};
use klab_storage::{
    split_sizes, Persistence, StorageError, StorageManager, StorageOptions, StorageType, StreamingHistogram, Value,
    NEXT_ID_PROPERTY, PROPERTIES_FILE,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn open(parallelism: usize) -> (TempDir, StorageManager) {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        scratch_dir: dir.path().join("ktmp"),
        mmap_initial_len: 256,
        ..StorageConfig::default()
    };
    let manager = StorageManager::open(&config, parallelism).unwrap();
    (dir, manager)
}

// ===== TEST 1: Single buffer over a 10-element line =====

#[test]
fn test_unsplit_double_storage() {
    let (_dir, manager) = open(1);
    let geometry = Geometry::linear(10).unwrap().shared();

    let storage = manager
        .storage("local:ctx.1", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();
    let buffers = storage.buffers(&geometry).unwrap();
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].size(), 10);
    assert_eq!(buffers[0].storage_type(), StorageType::Double);
    assert_eq!(buffers[0].urn(), format!("local:ctx.1#{}", buffers[0].id()));

    let mut filler = buffers[0].filler::<f64>().unwrap();
    let mut i = 0.0;
    while filler.has_next() {
        filler.add(i).unwrap();
        i += 1.0;
    }
    assert!(buffers[0].is_finalized());
    assert_eq!(storage.get(0, 7).unwrap(), Value::Double(7.0));
    assert_eq!(storage.get_at(0, &[3]).unwrap(), Value::Double(3.0));

    // same slice again: no new buffers
    let again = storage.buffers(&geometry).unwrap();
    assert!(Arc::ptr_eq(&buffers[0], &again[0]));
    assert_eq!(manager.last_buffer_id(), buffers[0].id());
}

// ===== TEST 2: Split into 3 over a slice of 10 =====

#[test]
fn test_split_sizes_three_three_four() {
    let (_dir, manager) = open(3);
    let geometry = Geometry::linear(10).unwrap().shared();
    let storage = manager
        .storage("local:ctx.2", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();

    let buffers = storage.buffers(&geometry).unwrap();
    let sizes: Vec<u64> = buffers.iter().map(|b| b.size()).collect();
    assert_eq!(sizes, vec![3, 3, 4]);
    let offsets: Vec<u64> = buffers.iter().map(|b| b.offset()).collect();
    assert_eq!(offsets, vec![0, 3, 6]);

    let ids: Vec<u64> = buffers.iter().map(|b| b.id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

// ===== TEST 3: Parallel fill of split buffers, merged histogram =====

#[test]
fn test_parallel_fill_and_histogram() {
    use rayon::prelude::*;

    let (_dir, manager) = open(4);
    let geometry = Geometry::grid(8, 5).unwrap().shared();
    let storage = manager
        .storage("local:ctx.3", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();
    let buffers = storage.buffers(&geometry).unwrap();
    assert_eq!(buffers.len(), 4);

    buffers.par_iter().for_each(|buffer| {
        let mut filler = buffer.filler::<f64>().unwrap();
        let mut position = buffer.offset();
        while filler.has_next() {
            filler.add(position as f64).unwrap();
            position += 1;
        }
    });

    let histogram = storage.histogram();
    assert_eq!(histogram.count(), 40);
    assert_eq!(histogram.min(), Some(0.0));
    assert_eq!(histogram.max(), Some(39.0));
    assert_eq!(histogram.sum(), (0..40).sum::<u64>() as f64);
    assert!(histogram.bins().len() <= 20);

    // cells are addressed in curve order, X fastest
    assert_eq!(storage.get_at(0, &[1, 0]).unwrap(), Value::Double(1.0));
    assert_eq!(storage.get_at(0, &[0, 1]).unwrap(), Value::Double(8.0));
}

// ===== TEST 4: Filler type must match storage type =====

#[test]
fn test_illegal_filler_type() {
    let (_dir, manager) = open(1);
    let geometry = Geometry::linear(4).unwrap().shared();
    let storage = manager
        .storage(
            "local:ctx.4",
            geometry.clone(),
            manager.default_options(&geometry, Some(StorageType::Long)),
        )
        .unwrap();
    let buffer = storage.buffers(&geometry).unwrap().remove(0);
    assert!(matches!(
        buffer.filler::<f64>(),
        Err(StorageError::IllegalFillerType {
            storage: StorageType::Long,
            requested: StorageType::Double
        })
    ));
    assert!(buffer.filler::<i64>().is_ok());
}

// ===== TEST 5: 2-D Hilbert over three varying dimensions =====

#[test]
fn test_hilbert_on_cube_creates_nothing() {
    let (_dir, manager) = open(1);
    let geometry = Geometry::cube(4, 4, 4).unwrap().shared();
    let storage = manager
        .storage("local:ctx.5", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();

    let result = storage.buffers_with_curve(&geometry, SpaceFillingCurve::D2Hilbert);
    assert!(matches!(
        result,
        Err(StorageError::Geometry(GeometryError::IncompatibleGeometry { .. }))
    ));
    assert!(storage.all_buffers().is_empty());
    assert_eq!(manager.last_buffer_id(), 0);
}

// ===== TEST 6: Partial access restrictions =====

#[test]
fn test_unsupported_partial_access() {
    let (_dir, manager) = open(1);
    let geometry = Geometry::new(vec![Dimension::time(3), Dimension::space("x", 5)])
        .unwrap()
        .shared();
    let storage = manager
        .storage("local:ctx.6", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();

    // whole geometry varies in time and space
    assert!(matches!(
        storage.buffers(&geometry),
        Err(StorageError::UnsupportedPartialAccess(_))
    ));

    // a spatially misaligned slice
    let shifted = Geometry::new(vec![
        Dimension::time(1),
        Dimension::space("x", 5).with_start(1),
    ])
    .unwrap();
    assert!(matches!(
        storage.buffers(&shifted),
        Err(StorageError::UnsupportedPartialAccess(_))
    ));
}

// ===== TEST 7: Time slices appended on demand =====

#[test]
fn test_time_slices_are_appended() {
    let (_dir, manager) = open(1);
    let geometry = Geometry::new(vec![Dimension::time(3), Dimension::space("x", 5)])
        .unwrap()
        .shared();
    let storage = manager
        .storage("local:ctx.7", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();

    for t in [2, 0] {
        let slice = geometry.time_slice(t).unwrap();
        let buffers = storage.buffers(&slice).unwrap();
        assert_eq!(buffers[0].time_start(), t);
        assert_eq!(buffers[0].size(), 5);
        let mut filler = buffers[0].filler::<f64>().unwrap();
        while filler.has_next() {
            filler.add(t as f64).unwrap();
        }
    }
    assert_eq!(storage.time_starts(), vec![0, 2]);
    assert_eq!(storage.get(2, 4).unwrap(), Value::Double(2.0));
    assert_eq!(storage.get(0, 4).unwrap(), Value::Double(0.0));
    assert!(storage.get(1, 0).is_err());
}

// ===== TEST 8: Curve remapping on a single-buffer slice =====

#[test]
fn test_remapped_filler_writes_storage_order() {
    let (_dir, manager) = open(1);
    let geometry = Geometry::grid(3, 2).unwrap().shared();
    let storage = manager
        .storage("local:ctx.8", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();
    let buffers = storage
        .buffers_with_curve(&geometry, SpaceFillingCurve::D2Yx)
        .unwrap();

    let mut filler = buffers[0]
        .remapped_filler::<f64>(SpaceFillingCurve::D2Yx)
        .unwrap();
    while filler.has_next() {
        let coordinates = filler.next_coordinates().unwrap();
        filler.add((coordinates[0] * 10 + coordinates[1]) as f64).unwrap();
    }
    for x in 0..3u64 {
        for y in 0..2u64 {
            assert_eq!(
                storage.get_at(0, &[x, y]).unwrap(),
                Value::Double((x * 10 + y) as f64)
            );
        }
    }
}

#[test]
fn test_split_storage_refuses_other_curve() {
    let (_dir, manager) = open(2);
    let geometry = Geometry::grid(3, 2).unwrap().shared();
    let storage = manager
        .storage("local:ctx.9", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();
    assert!(matches!(
        storage.buffers_with_curve(&geometry, SpaceFillingCurve::D2Yx),
        Err(StorageError::UnsupportedPartialAccess(_))
    ));
}

#[test]
fn test_cached_slice_is_reused_for_hilbert_storage() {
    let (_dir, manager) = open(1);
    let geometry = Geometry::grid(16, 16).unwrap().shared();
    let options = StorageOptions {
        fill_curve: SpaceFillingCurve::D2Hilbert,
        ..manager.default_options(&geometry, None)
    };
    let storage = manager.storage("local:ctx.10", geometry.clone(), options).unwrap();

    let first = storage.buffers(&geometry).unwrap();
    let again = storage.buffers(&geometry).unwrap();
    assert_eq!(first.len(), 1);
    assert!(Arc::ptr_eq(&first[0], &again[0]));
    assert_eq!(manager.last_buffer_id(), 1);

    // other curves are still checked against the cached slice
    assert!(matches!(
        storage.buffers_with_curve(&geometry, SpaceFillingCurve::D3Xyz),
        Err(StorageError::Geometry(GeometryError::IncompatibleGeometry { .. }))
    ));
    let morton = storage.buffers_with_curve(&geometry, SpaceFillingCurve::D2Morton).unwrap();
    assert!(Arc::ptr_eq(&first[0], &morton[0]));
    assert_eq!(storage.all_buffers().len(), 1);
}

// ===== TEST 9: Buffer ids persist across restarts =====

#[test]
fn test_buffer_ids_monotonic_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        scratch_dir: dir.path().join("ktmp"),
        ..StorageConfig::default()
    };
    let geometry = Geometry::linear(6).unwrap().shared();

    let first_ids: Vec<u64> = {
        let manager = StorageManager::open(&config, 2).unwrap();
        let storage = manager
            .storage("local:ctx.10", geometry.clone(), manager.default_options(&geometry, None))
            .unwrap();
        let ids = storage.buffers(&geometry).unwrap().iter().map(|b| b.id()).collect();
        manager.close().unwrap();
        ids
    };

    let properties = std::fs::read_to_string(config.scratch_dir.join(PROPERTIES_FILE)).unwrap();
    assert!(properties.contains(&format!("{}={}", NEXT_ID_PROPERTY, first_ids[1])));

    let manager = StorageManager::open(&config, 2).unwrap();
    let storage = manager
        .storage("local:ctx.10", geometry.clone(), manager.default_options(&geometry, None))
        .unwrap();
    let second = storage.buffers(&geometry).unwrap();
    assert!(second.iter().all(|b| b.id() > first_ids[1]));
}

#[test]
fn test_truncated_counter_refuses_to_reuse_ids() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        scratch_dir: dir.path().join("ktmp"),
        ..StorageConfig::default()
    };
    {
        let manager = StorageManager::open(&config, 1).unwrap();
        for _ in 0..5 {
            manager.next_buffer_id().unwrap();
        }
        assert_eq!(manager.last_buffer_id(), 5);
        manager.close().unwrap();
    }

    let path = config.scratch_dir.join(PROPERTIES_FILE);
    std::fs::write(&path, "").unwrap();
    assert!(matches!(
        StorageManager::open(&config, 1),
        Err(StorageError::InvalidProperties(_))
    ));
}

// ===== TEST 10: Finalized storage caches its histogram =====

#[test]
fn test_histogram_cached_after_finalize() {
    let (_dir, manager) = open(2);
    let geometry = Geometry::linear(4).unwrap().shared();
    let storage = manager
        .storage(
            "local:ctx.11",
            geometry.clone(),
            manager
                .default_options(&geometry, None)
                .with_persistence(Persistence::ContextEnd),
        )
        .unwrap();
    let buffers = storage.buffers(&geometry).unwrap();
    buffers[0].filler::<f64>().unwrap().add(1.0).unwrap();
    assert_eq!(storage.histogram().count(), 1);

    storage.finalize().unwrap();
    assert!(storage.is_finalized());
    let cached = storage.histogram();
    // corrections through set never reach the histogram
    buffers[1].set(0, &Value::Double(50.0)).unwrap();
    assert_eq!(storage.histogram(), cached);
}

// ===== TEST 11: Keyed storage =====

#[test]
fn test_keyed_storage_shares_dictionary() {
    let (_dir, manager) = open(2);
    let geometry = Geometry::linear(4).unwrap().shared();
    let storage = manager
        .storage(
            "local:ctx.12",
            geometry.clone(),
            manager.default_options(&geometry, Some(StorageType::Keyed)),
        )
        .unwrap();
    let buffers = storage.buffers(&geometry).unwrap();
    for (buffer, key) in buffers.iter().zip(["wet", "dry"]) {
        let mut filler = buffer.keyed_filler().unwrap();
        while filler.has_next() {
            filler.add(key).unwrap();
        }
    }
    assert_eq!(storage.keys().unwrap().len(), 2);
    assert_eq!(storage.get(0, 3).unwrap(), Value::Key("dry".into()));
    assert_eq!(storage.histogram().categories().get("wet"), Some(&2));
}

// ===== PROPERTY TESTS =====

proptest! {
    #[test]
    fn prop_split_sizes_cover_slice(total in 1u64..5000, splits in 1usize..64) {
        let sizes = split_sizes(total, splits);
        prop_assert_eq!(sizes.iter().sum::<u64>(), total);
        let n = sizes.len() as u64;
        prop_assert!(n >= 1 && n <= total);
        for size in &sizes[..sizes.len() - 1] {
            prop_assert_eq!(*size, total / n);
        }
        prop_assert_eq!(*sizes.last().unwrap(), total / n + total % n);
    }

    #[test]
    fn prop_histogram_merge_any_order(
        values in prop::collection::vec(-1.0e6f64..1.0e6, 1..200),
        cuts in prop::collection::vec(0usize..200, 0..6),
    ) {
        let mut direct = StreamingHistogram::new(20);
        values.iter().for_each(|v| direct.insert(*v));

        let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c % values.len()).collect();
        bounds.push(0);
        bounds.push(values.len());
        bounds.sort_unstable();
        bounds.dedup();
        let mut parts: Vec<StreamingHistogram> = bounds
            .windows(2)
            .map(|w| {
                let mut h = StreamingHistogram::new(20);
                values[w[0]..w[1]].iter().for_each(|v| h.insert(*v));
                h
            })
            .collect();

        let mut forward = StreamingHistogram::new(20);
        parts.iter().for_each(|p| forward.merge(p));
        parts.reverse();
        let mut backward = StreamingHistogram::new(20);
        parts.iter().for_each(|p| backward.merge(p));

        for merged in [&forward, &backward] {
            prop_assert_eq!(merged.count(), direct.count());
            prop_assert_eq!(merged.min(), direct.min());
            prop_assert_eq!(merged.max(), direct.max());
            prop_assert!((merged.sum() - direct.sum()).abs() <= 1e-6 * (1.0 + direct.sum().abs()));
        }
    }
}
