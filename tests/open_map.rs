use saddlebag::OpenMap;

// Deterministic key stream so failures reproduce.
fn xorshift_keys(seed: u32, n: usize) -> Vec<u32> {
    let mut state = seed;
    let mut keys = Vec::with_capacity(n);
    let mut seen = std::collections::HashSet::new();
    while keys.len() < n {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        if seen.insert(state) {
            keys.push(state);
        }
    }
    keys
}

#[test]
fn round_trip_small() {
    let mut map: OpenMap<u32, u64> = OpenMap::new();
    for k in 0u32..100 {
        assert!(map.get(&k).is_none());
        map.insert(k, u64::from(k) * 3);
    }
    assert_eq!(map.len(), 100);
    for k in 0u32..100 {
        assert_eq!(map.get(&k), Some(&(u64::from(k) * 3)));
    }
    assert!(map.get(&1000).is_none());
    assert!(!map.contains_key(&1000));
}

#[test]
fn get_mut_updates_in_place() {
    let mut map: OpenMap<u32, u64> = OpenMap::new();
    map.insert(7, 1);
    *map.get_mut(&7).unwrap() = 42;
    assert_eq!(map.get(&7), Some(&42));
}

#[test]
fn grow_keeps_every_key() {
    let keys = xorshift_keys(0xDEAD_BEEF, 5_000);
    let mut map: OpenMap<u32, u32> = OpenMap::new();
    assert_eq!(map.capacity(), 1_024);

    for (i, &k) in keys.iter().enumerate() {
        map.insert(k, k.wrapping_mul(31));
        // Keys stay findable across every intermediate grow.
        if i % 512 == 0 {
            assert_eq!(map.get(&keys[0]), Some(&keys[0].wrapping_mul(31)));
        }
    }

    assert_eq!(map.len(), 5_000);
    // Load factor 0.5 with doubling from 1024 lands at 16384 for 5000 keys.
    assert_eq!(map.capacity(), 16_384);
    for &k in &keys {
        assert_eq!(map.get(&k), Some(&k.wrapping_mul(31)));
    }
}

#[test]
fn iteration_visits_each_entry_once() {
    let keys = xorshift_keys(42, 5_000);
    let mut map: OpenMap<u32, u32> = OpenMap::new();
    for &k in &keys {
        map.insert(k, k);
    }

    let visited: Vec<u32> = map.iter().map(|(k, _)| *k).collect();
    assert_eq!(visited.len(), 5_000);
    let unique: std::collections::HashSet<u32> = visited.iter().copied().collect();
    assert_eq!(unique.len(), 5_000);
    assert!(keys.iter().all(|k| unique.contains(k)));

    // Array order is stable while the map is unmutated.
    let again: Vec<u32> = map.iter().map(|(k, _)| *k).collect();
    assert_eq!(visited, again);
}

#[test]
fn iter_mut_reaches_every_value() {
    let mut map: OpenMap<u32, u32> = OpenMap::new();
    for k in 0u32..2_000 {
        map.insert(k, 0);
    }
    for (k, v) in map.iter_mut() {
        *v = *k + 1;
    }
    for k in 0u32..2_000 {
        assert_eq!(map.get(&k), Some(&(k + 1)));
    }
}

#[test]
fn boxed_values_drop_cleanly() {
    // Heap-owning values exercise the occupied-slot drop path.
    let mut map: OpenMap<u64, Box<Vec<u8>>> = OpenMap::with_capacity(8);
    for k in 0u64..600 {
        map.insert(k, Box::new(vec![k as u8; 16]));
    }
    assert_eq!(map.get(&5).map(|v| v.len()), Some(16));
    drop(map);
}
