// Typed item containers.
//
// Each table is monomorphic over its item type, so item storage and
// callback dispatch carry no per-item indirection beyond the box holding
// the cell. The worker's table list erases the item type behind
// [`TableOps`]; `add_item` recovers the concrete table by downcast.

use std::any::Any;

use crate::buffers::SendBuffers;
use crate::item::{Item, ItemCtx, ItemMeta};
use crate::map::OpenMap;
use crate::message::{partition_of, ItemKey, Message, TableKey, Value};

/// Outcome of inserting or delivering to an item. The numeric codes are
/// the framework's reporting values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ItemStatus {
    NotFound = 0,
    CreatedNewLocal = 100,
    RequestedNewRemote = 200,
    FoundExistingLocal = 300,
    IgnoredNewRemote = 400,
    IgnoredNewLocal = 500,
}

pub(crate) struct ItemCell<T, K, V, U> {
    pub(crate) meta: ItemMeta<T, K, V>,
    pub(crate) state: U,
}

/// A container of items of one application type, indexed by item key.
/// Holds this rank's partition only; items whose home is another rank
/// never appear here.
pub struct Table<T, K, V, U> {
    table_key: T,
    #[allow(dead_code)]
    is_global: bool,
    items: OpenMap<K, Box<ItemCell<T, K, V, U>>>,
}

impl<T, K, V, U> Table<T, K, V, U>
where
    T: TableKey,
    K: ItemKey,
    V: Value,
    U: Item<T, K, V>,
{
    pub(crate) fn new(table_key: T, is_global: bool) -> Self {
        Table {
            table_key,
            is_global,
            items: OpenMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&U> {
        self.items.get(key).map(|cell| &cell.state)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut U> {
        self.items.get_mut(key).map(|cell| &mut cell.state)
    }

    /// Iterate this partition's items in map order. The order is stable
    /// while the table is not mutated.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &U)> {
        self.items.iter().map(|(k, cell)| (k, &cell.state))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut U)> {
        self.items.iter_mut().map(|(k, cell)| (k, &mut cell.state))
    }

    /// Construct an item, bind its identity, run `on_create` then
    /// `refresh`, and insert it.
    fn create_new_item(
        &mut self,
        key: K,
        outbox: &mut SendBuffers<T, K, V>,
        cycle: u64,
    ) -> &mut Box<ItemCell<T, K, V, U>> {
        let mut cell = Box::new(ItemCell {
            meta: ItemMeta {
                table_key: self.table_key,
                item_key: key,
                value: V::default(),
                next_seqnum: 0,
            },
            state: U::default(),
        });
        {
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.on_create(&mut cx);
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.refresh(&mut cx);
        }
        self.items.insert(key, cell);
        self.items
            .get_mut(&key)
            .expect("freshly inserted item present")
    }

    /// Local-partition half of `add_item`: find-and-refresh, create, or
    /// ignore. The caller has already established that `key`'s home is this
    /// rank.
    pub(crate) fn add_local(
        &mut self,
        key: K,
        create_if_absent: bool,
        outbox: &mut SendBuffers<T, K, V>,
        cycle: u64,
    ) -> (Option<&mut U>, ItemStatus) {
        if self.items.contains_key(&key) {
            let cell = self.items.get_mut(&key).expect("probed item present");
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.refresh(&mut cx);
            return (Some(&mut cell.state), ItemStatus::FoundExistingLocal);
        }
        if create_if_absent {
            let cell = self.create_new_item(key, outbox, cycle);
            return (Some(&mut cell.state), ItemStatus::CreatedNewLocal);
        }
        (None, ItemStatus::IgnoredNewLocal)
    }
}

/// Type-erased table operations the cycle engine drives.
pub(crate) trait TableOps<T: TableKey, K: ItemKey, V: Value>: 'static {
    /// Deliver one message to its destination item, creating it first when
    /// the create-on-push policy allows.
    fn apply(
        &mut self,
        msg: &Message<T, K, V>,
        create_if_absent: bool,
        outbox: &mut SendBuffers<T, K, V>,
        cycle: u64,
    ) -> ItemStatus;

    /// Run the three work callbacks on every item, in map order.
    fn work(&mut self, outbox: &mut SendBuffers<T, K, V>, cycle: u64);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T, K, V, U> TableOps<T, K, V> for Table<T, K, V, U>
where
    T: TableKey,
    K: ItemKey,
    V: Value,
    U: Item<T, K, V>,
{
    fn apply(
        &mut self,
        msg: &Message<T, K, V>,
        create_if_absent: bool,
        outbox: &mut SendBuffers<T, K, V>,
        cycle: u64,
    ) -> ItemStatus {
        // A message that reaches the wrong rank is a sender-side partition
        // bug; count it, do not deliver.
        if partition_of(&msg.dest_item, outbox.rank_n()) != outbox.rank_me() {
            return ItemStatus::IgnoredNewRemote;
        }

        let key = msg.dest_item;
        if let Some(cell) = self.items.get_mut(&key) {
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.on_push_recv(msg.value, &mut cx);
            return ItemStatus::FoundExistingLocal;
        }
        if create_if_absent {
            let cell = self.create_new_item(key, outbox, cycle);
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.on_push_recv(msg.value, &mut cx);
            return ItemStatus::CreatedNewLocal;
        }
        ItemStatus::IgnoredNewLocal
    }

    fn work(&mut self, outbox: &mut SendBuffers<T, K, V>, cycle: u64) {
        for (_, cell) in self.items.iter_mut() {
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.before_work(&mut cx);
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.do_work(&mut cx);
            let mut cx = ItemCtx::new(&mut cell.meta, outbox, cycle);
            cell.state.finishing_work(&mut cx);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
