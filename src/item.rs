// The user-facing callback surface.
//
// An item is a piece of application state owned by exactly one worker (its
// home rank). User code never holds a reference from the item back to the
// worker; instead every callback receives an [`ItemCtx`] that carries the
// item's identity and the worker's outgoing buffers for the duration of the
// call.

use crate::buffers::SendBuffers;
use crate::message::{ItemKey, Message, TableKey, Value};

/// Fixed per-item state the framework maintains alongside the user state.
pub(crate) struct ItemMeta<T, K, V> {
    pub(crate) table_key: T,
    pub(crate) item_key: K,
    pub(crate) value: V,
    pub(crate) next_seqnum: u32,
}

/// Per-callback view of an item's identity and its worker's send side.
pub struct ItemCtx<'a, T, K, V> {
    meta: &'a mut ItemMeta<T, K, V>,
    outbox: &'a mut SendBuffers<T, K, V>,
    cycle: u64,
}

impl<'a, T: TableKey, K: ItemKey, V: Value> ItemCtx<'a, T, K, V> {
    pub(crate) fn new(
        meta: &'a mut ItemMeta<T, K, V>,
        outbox: &'a mut SendBuffers<T, K, V>,
        cycle: u64,
    ) -> Self {
        ItemCtx { meta, outbox, cycle }
    }

    #[inline]
    pub fn table_key(&self) -> T {
        self.meta.table_key
    }

    #[inline]
    pub fn item_key(&self) -> K {
        self.meta.item_key
    }

    /// The item's resident value slot.
    #[inline]
    pub fn value(&self) -> &V {
        &self.meta.value
    }

    #[inline]
    pub fn value_mut(&mut self) -> &mut V {
        &mut self.meta.value
    }

    /// Sequence counter reserved for the pull sub-protocol.
    #[inline]
    pub fn next_seqnum(&self) -> u32 {
        self.meta.next_seqnum
    }

    #[inline]
    pub fn set_next_seqnum(&mut self, seqnum: u32) {
        self.meta.next_seqnum = seqnum;
    }

    /// The cycle the worker is currently executing.
    #[inline]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    #[inline]
    pub fn rank_me(&self) -> usize {
        self.outbox.rank_me()
    }

    #[inline]
    pub fn rank_n(&self) -> usize {
        self.outbox.rank_n()
    }

    /// Enqueue one message from this item. It is appended to the outgoing
    /// buffer for the destination's partition and delivered in the exchange
    /// phase of the next cycle.
    pub fn push(&mut self, dest_table: T, dest_item: K, value: V) {
        let msg = Message {
            value,
            src_table: self.meta.table_key,
            dest_table,
            dest_item,
            src_item: self.meta.item_key,
        };
        self.outbox.enqueue(msg);
    }
}

/// Application state attached to one (table, key) pair.
///
/// All callbacks default to no-ops; implement the ones the application
/// needs. Per cycle with work enabled, `before_work`, `do_work` and
/// `finishing_work` run in that order on every item.
pub trait Item<T: TableKey, K: ItemKey, V: Value>: Default + 'static {
    /// Invoked exactly once, at first instantiation.
    fn on_create(&mut self, _cx: &mut ItemCtx<'_, T, K, V>) {}

    /// Invoked at creation and again on every later `add_item` for the same
    /// key on the home rank.
    fn refresh(&mut self, _cx: &mut ItemCtx<'_, T, K, V>) {}

    /// Invoked once per incoming message destined for this item.
    fn on_push_recv(&mut self, _value: V, _cx: &mut ItemCtx<'_, T, K, V>) {}

    fn before_work(&mut self, _cx: &mut ItemCtx<'_, T, K, V>) {}

    fn do_work(&mut self, _cx: &mut ItemCtx<'_, T, K, V>) {}

    fn finishing_work(&mut self, _cx: &mut ItemCtx<'_, T, K, V>) {}

    /// Reserved for the pull sub-protocol; the cycle engine never invokes
    /// it.
    fn returning_pull(&mut self, _message: &Message<T, K, V>, _cx: &mut ItemCtx<'_, T, K, V>) {}
}
