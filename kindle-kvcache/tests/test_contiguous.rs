use kindle_core::{DType, KindleError, KvCache, KvCacheShape};
use kindle_kvcache::ContiguousKvCache;

fn shape(capacity: usize) -> KvCacheShape {
    KvCacheShape {
        capacity,
        n_layer: 2,
        n_head: 2,
        head_dim: 2,
    }
}

/// Rows whose every element equals the position, keys positive, values negative.
fn rows(first_pos: usize, n_tokens: usize, row: usize) -> (Vec<f32>, Vec<f32>) {
    let keys: Vec<f32> = (first_pos..first_pos + n_tokens)
        .flat_map(|p| std::iter::repeat(p as f32).take(row))
        .collect();
    let values = keys.iter().map(|k| -k).collect();
    (keys, values)
}

fn append(cache: &mut ContiguousKvCache, first_pos: usize, n_tokens: usize) -> kindle_core::Result<()> {
    let (k, v) = rows(first_pos, n_tokens, cache.shape().row_size());
    cache.append(n_tokens, &k, &v)
}

#[test]
fn test_appends_sum_to_len() {
    let mut cache = ContiguousKvCache::new(shape(16), DType::F32);
    let mut total = 0;
    for n in [3, 1, 5, 0, 7] {
        append(&mut cache, total, n).unwrap();
        total += n;
        assert_eq!(cache.len(), total);
        assert_eq!(cache.usage().usage_ratio(), total as f32 / 16.0);
    }
    assert_eq!(cache.usage().free(), 0);
    assert_eq!(cache.usage().usage_ratio(), 1.0);
}

#[test]
fn test_shift_moves_entries_to_front() {
    let mut cache = ContiguousKvCache::new(shape(8), DType::F32);
    append(&mut cache, 0, 6).unwrap();

    cache.shift(2).unwrap();
    assert_eq!(cache.len(), 4);
    // the position formerly at index 2 is now at index 0
    assert_eq!(cache.read_key(0, 0).unwrap(), vec![2.0; 4]);
    assert_eq!(cache.read_value(0, 1).unwrap(), vec![-2.0; 4]);
    assert_eq!(cache.read_key(3, 1).unwrap(), vec![5.0; 4]);
    assert!(cache.read_key(4, 0).is_err());
}

#[test]
fn test_shift_beyond_len_fails_without_mutation() {
    let mut cache = ContiguousKvCache::new(shape(8), DType::F32);
    append(&mut cache, 0, 3).unwrap();
    let before = cache.snapshot();

    let err = cache.shift(4).unwrap_err();
    assert!(matches!(err, KindleError::ShiftOutOfRange { n_discard: 4, n: 3 }));
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.snapshot(), before);
}

#[test]
fn test_shift_zero_is_noop() {
    let mut cache = ContiguousKvCache::new(shape(4), DType::F32);
    append(&mut cache, 0, 2).unwrap();
    cache.shift(0).unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.read_key(1, 0).unwrap(), vec![1.0; 4]);
}

#[test]
fn test_capacity_scenario() {
    // capacity 4: fill, shift 2, refill, then overflow by one
    let mut cache = ContiguousKvCache::new(shape(4), DType::F32);
    append(&mut cache, 0, 4).unwrap();
    assert_eq!(cache.len(), 4);

    cache.shift(2).unwrap();
    assert_eq!(cache.len(), 2);

    assert!(cache.append_allowed(2));
    append(&mut cache, 4, 2).unwrap();
    assert_eq!(cache.len(), 4);

    assert!(!cache.append_allowed(1));
    let err = append(&mut cache, 6, 1).unwrap_err();
    assert!(matches!(
        err,
        KindleError::CapacityExceeded {
            current: 4,
            incoming: 1,
            capacity: 4
        }
    ));
    assert_eq!(cache.len(), 4);
    assert_eq!(cache.read_key(3, 0).unwrap(), vec![5.0; 4]);
}

#[test]
fn test_append_rejects_wrong_row_count() {
    let mut cache = ContiguousKvCache::new(shape(4), DType::F32);
    let err = cache.append(2, &[0.0; 8], &[0.0; 8]).unwrap_err();
    assert!(matches!(err, KindleError::ShapeMismatch { .. }));
    assert!(cache.is_empty());
}

#[test]
fn test_f16_storage_reads_back() {
    let mut cache = ContiguousKvCache::new(shape(4), DType::F16);
    let row = cache.shape().row_size();
    let keys: Vec<f32> = (0..row).map(|i| i as f32 * 0.5).collect();
    let values: Vec<f32> = keys.iter().map(|x| x + 1.0).collect();
    cache.append(1, &keys, &values).unwrap();

    // values exactly representable in f16
    assert_eq!(cache.read_key(0, 0).unwrap(), keys[..4].to_vec());
    assert_eq!(cache.read_value(0, 1).unwrap(), values[4..].to_vec());
}

#[test]
fn test_zero_width_rows_count_positions() {
    let shape = KvCacheShape {
        capacity: 3,
        n_layer: 4,
        n_head: 4,
        head_dim: 0,
    };
    let mut cache = ContiguousKvCache::new(shape, DType::F32);
    cache.append(2, &[], &[]).unwrap();
    assert_eq!(cache.len(), 2);
    cache.shift(1).unwrap();
    assert_eq!(cache.len(), 1);
    assert!(cache.append(3, &[], &[]).is_err());
}

#[test]
fn test_snapshot_restore_roundtrip() {
    for dtype in [DType::F32, DType::F16] {
        let mut cache = ContiguousKvCache::new(shape(6), dtype);
        append(&mut cache, 0, 5).unwrap();
        cache.shift(1).unwrap();
        let snap = cache.snapshot();
        assert_eq!(snap.keys.len(), snap.expected_bytes());

        let mut other = ContiguousKvCache::new(shape(6), dtype);
        other.restore(&snap).unwrap();
        assert_eq!(other.len(), 4);
        assert_eq!(other.snapshot(), snap);
        assert_eq!(other.read_key(0, 0).unwrap(), vec![1.0; 4]);
    }
}

#[test]
fn test_restore_rejects_mismatch() {
    let mut cache = ContiguousKvCache::new(shape(6), DType::F32);
    append(&mut cache, 0, 2).unwrap();
    let snap = cache.snapshot();

    let mut wrong_dtype = ContiguousKvCache::new(shape(6), DType::F16);
    assert!(wrong_dtype.restore(&snap).is_err());
    assert!(wrong_dtype.is_empty());

    let mut wrong_shape = ContiguousKvCache::new(shape(8), DType::F32);
    assert!(wrong_shape.restore(&snap).is_err());

    let mut truncated = snap.clone();
    truncated.values.pop();
    let mut target = ContiguousKvCache::new(shape(6), DType::F32);
    assert!(target.restore(&truncated).is_err());
    assert!(target.is_empty());
}
