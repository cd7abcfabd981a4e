// Fixed-probe open-addressing map from item key to item storage.
//
// Capacity is always a power of two so the home slot reduction is a single
// bitwise-and. An empty slot is marked by a reserved sentinel hash; the key
// and value payload of a slot is only initialized while its hash is live.

use std::mem::MaybeUninit;

use crate::hash::StableHash32;

/// Reserved hash marking an empty slot. A key whose real hash collides with
/// the sentinel is remapped to the neighboring value.
const EMPTY_HASH: u32 = 0xFFFF_FFFF;

/// Initial slot count. Matches the load the framework expects before the
/// first grow.
const INITIAL_CAPACITY: usize = 1024;

struct Slot<K, V> {
    hash: u32,
    pair: MaybeUninit<(K, V)>,
}

/// Open-addressing map with linear probing and grow-on-load-factor 0.5.
///
/// No deletion: the cycle protocol never removes items, so tombstones are
/// unnecessary and every probe chain ends at a match or an empty slot.
pub struct OpenMap<K, V> {
    slots: Box<[Slot<K, V>]>,
    mask: usize,
    len: usize,
}

fn empty_slots<K, V>(capacity: usize) -> Box<[Slot<K, V>]> {
    debug_assert!(capacity.is_power_of_two());
    (0..capacity)
        .map(|_| Slot {
            hash: EMPTY_HASH,
            pair: MaybeUninit::uninit(),
        })
        .collect()
}

#[inline]
fn slot_hash<K: StableHash32>(key: &K) -> u32 {
    let h = key.stable_hash32();
    if h == EMPTY_HASH {
        EMPTY_HASH - 1
    } else {
        h
    }
}

impl<K: StableHash32 + Eq, V> OpenMap<K, V> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// `capacity` is rounded up to the next power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        OpenMap {
            slots: empty_slots(capacity),
            mask: capacity - 1,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert a key that is not present. The caller guarantees exclusivity
    /// via a prior [`get`](Self::get); a duplicate insert corrupts the map's
    /// length accounting, not its probing, so it is a caller bug.
    pub fn insert(&mut self, key: K, value: V) {
        if self.len > self.capacity() / 2 {
            self.grow(self.capacity() * 2);
        }
        let hash = slot_hash(&key);
        Self::insert_raw(&mut self.slots, self.mask, hash, key, value);
        self.len += 1;
    }

    /// Linear probe from the home slot; first empty slot wins. Load factor
    /// 0.5 guarantees an empty slot exists, bounding the probe.
    fn insert_raw(slots: &mut [Slot<K, V>], mask: usize, hash: u32, key: K, value: V) {
        let mut idx = hash as usize & mask;
        loop {
            let slot = &mut slots[idx];
            if slot.hash == EMPTY_HASH {
                slot.hash = hash;
                slot.pair.write((key, value));
                return;
            }
            idx = (idx + 1) & mask;
        }
    }

    fn probe(&self, key: &K) -> Option<usize> {
        let hash = slot_hash(key);
        let mut idx = hash as usize & self.mask;
        loop {
            let slot = &self.slots[idx];
            if slot.hash == EMPTY_HASH {
                return None;
            }
            if slot.hash == hash {
                let (k, _) = unsafe { slot.pair.assume_init_ref() };
                if k == key {
                    return Some(idx);
                }
            }
            idx = (idx + 1) & self.mask;
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.probe(key).map(|idx| {
            let (_, v) = unsafe { self.slots[idx].pair.assume_init_ref() };
            v
        })
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.probe(key).map(|idx| {
            let (_, v) = unsafe { self.slots[idx].pair.assume_init_mut() };
            v
        })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.probe(key).is_some()
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_slots = empty_slots(new_capacity);
        let new_mask = new_capacity - 1;
        let old_slots = std::mem::replace(&mut self.slots, Vec::new().into_boxed_slice());
        for slot in old_slots.into_vec() {
            if slot.hash != EMPTY_HASH {
                // Reinsert with the stored hash; no rehashing on grow.
                let (key, value) = unsafe { slot.pair.assume_init() };
                Self::insert_raw(&mut new_slots, new_mask, slot.hash, key, value);
            }
        }
        self.slots = new_slots;
        self.mask = new_mask;
    }

    /// Visit non-empty slots in array order. The order is stable across
    /// reads while no mutation occurs.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: self.slots.iter(),
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut {
            slots: self.slots.iter_mut(),
        }
    }
}

impl<K: StableHash32 + Eq, V> Default for OpenMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for OpenMap<K, V> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.hash != EMPTY_HASH {
                unsafe { slot.pair.assume_init_drop() };
            }
        }
    }
}

pub struct Iter<'a, K, V> {
    slots: std::slice::Iter<'a, Slot<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        for slot in self.slots.by_ref() {
            if slot.hash != EMPTY_HASH {
                let (k, v) = unsafe { slot.pair.assume_init_ref() };
                return Some((k, v));
            }
        }
        None
    }
}

pub struct IterMut<'a, K, V> {
    slots: std::slice::IterMut<'a, Slot<K, V>>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        for slot in self.slots.by_ref() {
            if slot.hash != EMPTY_HASH {
                let (k, v) = unsafe { slot.pair.assume_init_mut() };
                return Some((&*k, v));
            }
        }
        None
    }
}
