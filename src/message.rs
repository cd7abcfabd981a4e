// The wire record exchanged between workers.
//
// Messages cross process boundaries as raw bytes (direct pointer reads on a
// node, one-sided array reads between nodes), so the record is `#[repr(C)]`,
// `Copy`, and must not contain indirections. All cooperating ranks run the
// same binary, which fixes the layout globally.

use crate::hash::StableHash32;

/// Table identifiers: small dense integers indexing the worker's table list.
pub trait TableKey: Copy + Eq + std::fmt::Debug + 'static {
    fn as_index(self) -> usize;
}

macro_rules! impl_table_key {
    ($($t:ty),*) => {
        $(impl TableKey for $t {
            #[inline]
            fn as_index(self) -> usize {
                self as usize
            }
        })*
    };
}

impl_table_key!(u8, u16, u32, usize);

/// Item identifiers: trivially copyable and stably hashable, so every rank
/// agrees on an item's home partition.
pub trait ItemKey: Copy + Eq + StableHash32 + std::fmt::Debug + 'static {}

impl<K: Copy + Eq + StableHash32 + std::fmt::Debug + 'static> ItemKey for K {}

/// Message payloads: fixed-size, trivially copyable application values.
/// Variable-size payloads must be inlined into fixed bytes by the user.
pub trait Value: Copy + Default + std::fmt::Debug + 'static {}

impl<V: Copy + Default + std::fmt::Debug + 'static> Value for V {}

/// One push from a source item to a destination item.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Message<T, K, V> {
    pub value: V,
    pub src_table: T,
    pub dest_table: T,
    pub dest_item: K,
    pub src_item: K,
}

/// The home rank of a key: `hash32(key) mod ranks`. Every rank computes the
/// same answer for the same key, which is what makes exactly one rank the
/// home of each (table, key) pair.
#[inline]
pub fn partition_of<K: ItemKey>(key: &K, ranks: usize) -> usize {
    key.stable_hash32() as usize % ranks
}
