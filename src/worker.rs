// The per-process engine: item store, per-peer buffers, cycle protocol.
//
// A cycle is a barrier sandwich: quiesce, validate, exchange, clear, work.
// All cross-rank reads happen inside the exchange phase while every rank is
// between the same pair of barriers, which is what makes the unsynchronized
// buffer accesses safe.

use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::buffers::{BufferPool, SendBuffers};
use crate::error::{recommended_size, WorkerError};
use crate::item::Item;
use crate::message::{partition_of, ItemKey, Message, TableKey, Value};
use crate::substrate::{RgetTicket, Substrate};
use crate::table::{ItemStatus, Table, TableOps};

/// Default per-peer buffer capacity, in messages.
pub const DEFAULT_BUFFER_SIZE: usize = 500;

/// How outgoing pushes leave the worker. Combining appends each push to a
/// per-peer FIFO drained on cycle; it is the only mode, further modes are
/// reserved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendingMode {
    #[default]
    Combining,
}

/// Knobs fixed at worker construction.
#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    /// Capacity M of each per-peer send buffer, in messages.
    pub buffer_size: usize,
    pub mode: SendingMode,
    /// Create unknown destination items on receipt of a push.
    pub create_on_push: bool,
    /// Poke substrate progress every this many loop steps.
    pub progress_interval: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            buffer_size: DEFAULT_BUFFER_SIZE,
            mode: SendingMode::Combining,
            create_on_push: true,
            progress_interval: 5,
        }
    }
}

/// Builds a [`Worker`] against a substrate endpoint.
#[derive(Default)]
pub struct WorkerBuilder {
    config: WorkerConfig,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_size(mut self, messages: usize) -> Self {
        self.config.buffer_size = messages;
        self
    }

    pub fn mode(mut self, mode: SendingMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn create_on_push(mut self, enabled: bool) -> Self {
        self.config.create_on_push = enabled;
        self
    }

    pub fn progress_interval(mut self, interval: usize) -> Self {
        assert!(interval > 0, "progress interval must be positive");
        self.config.progress_interval = interval;
        self
    }

    /// Register the buffer pool in the shared segment, publish its handle,
    /// and wait for every rank to do the same. Collective: all ranks must
    /// construct their workers together.
    pub fn build<T, K, V>(self, substrate: Arc<dyn Substrate>) -> io::Result<Worker<T, K, V>>
    where
        T: TableKey,
        K: ItemKey,
        V: Value,
    {
        Worker::with_config(substrate, self.config)
    }
}

/// Diagnostics for one completed cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Messages this rank enqueued, truncated at capacity per buffer.
    pub sent: u64,
    /// Messages delivered from co-located peers (and from this rank).
    pub recv_local: u64,
    /// Messages delivered via one-sided reads from remote peers.
    pub recv_remote: u64,
    /// Smallest and largest counter seen by the validation scan.
    pub buffer_min: u64,
    pub buffer_max: u64,
    /// Buffer size the validation scan would recommend.
    pub recommended: u64,
    /// Received messages naming a table this worker does not have.
    pub malformed: u64,
    /// Received messages whose destination's home is another rank.
    pub misrouted: u64,
}

/// The per-process engine driving a fixed set of typed tables through
/// synchronous cycles.
pub struct Worker<T, K, V> {
    substrate: Arc<dyn Substrate>,
    config: WorkerConfig,
    rank: usize,
    ranks: usize,
    nodes: usize,
    local_root: bool,
    tables: Vec<Box<dyn TableOps<T, K, V>>>,
    outbox: SendBuffers<T, K, V>,
    pool: BufferPool<T, K, V>,
    /// Send counters captured at cycle entry, before any peer can clear
    /// them; the validation scan and sent accounting read this.
    snapshot: Vec<u64>,
    cycles: u64,
    error: Option<WorkerError>,
    stats: CycleStats,
    last_stats: CycleStats,
}

impl<T, K, V> Worker<T, K, V>
where
    T: TableKey,
    K: ItemKey,
    V: Value,
{
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    fn with_config(substrate: Arc<dyn Substrate>, config: WorkerConfig) -> io::Result<Self> {
        assert!(config.buffer_size > 0, "buffer size must be positive");
        let rank = substrate.rank_me();
        let ranks = substrate.rank_n();
        let team = substrate.local_rank_n();
        let nodes = ranks / team + usize::from(ranks % team != 0);
        let local_root = substrate.local_rank_me() == 0;

        let (pool, outbox) = BufferPool::create(substrate.as_ref(), config.buffer_size)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!(
                        "out of memory registering buffers (error {}): \
                         {} ranks, capacity {}, message size {}: {e}",
                        WorkerError::OutOfMemory.code(),
                        ranks,
                        config.buffer_size,
                        mem::size_of::<Message<T, K, V>>(),
                    ),
                )
            })?;
        debug!(
            rank,
            ranks,
            capacity = config.buffer_size,
            msg_size = mem::size_of::<Message<T, K, V>>(),
            "registered message buffers"
        );
        substrate.barrier();

        Ok(Worker {
            substrate,
            config,
            rank,
            ranks,
            nodes,
            local_root,
            tables: Vec::with_capacity(5),
            outbox,
            pool,
            snapshot: vec![0; ranks],
            cycles: 0,
            error: None,
            stats: CycleStats::default(),
            last_stats: CycleStats::default(),
        })
    }

    #[inline]
    pub fn rank_me(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn rank_n(&self) -> usize {
        self.ranks
    }

    #[inline]
    pub fn total_nodes(&self) -> usize {
        self.nodes
    }

    #[inline]
    pub fn total_tables(&self) -> usize {
        self.tables.len()
    }

    /// Completed cycles.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    #[inline]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The sticky error, if any cycle detected one.
    #[inline]
    pub fn error(&self) -> Option<WorkerError> {
        self.error
    }

    /// Diagnostics of the most recently completed communicating cycle.
    #[inline]
    pub fn last_cycle_stats(&self) -> CycleStats {
        self.last_stats
    }

    /// The home rank of `(table, key)`.
    #[inline]
    pub fn get_partition(&self, _table_key: T, item_key: &K) -> usize {
        partition_of(item_key, self.ranks)
    }

    /// Declare a table. Keys must arrive densely, in order: the first table
    /// is key 0, the next key 1, and so on. `is_global` is reserved
    /// metadata; the engine treats all tables uniformly.
    pub fn add_table<U: Item<T, K, V>>(&mut self, table_key: T, is_global: bool) {
        assert_eq!(
            table_key.as_index(),
            self.tables.len(),
            "table keys must be dense and declared in order"
        );
        self.tables
            .push(Box::new(Table::<T, K, V, U>::new(table_key, is_global)));
    }

    /// The concrete table for `table_key`, if its item type is `U`.
    pub fn table<U: Item<T, K, V>>(&self, table_key: T) -> Option<&Table<T, K, V, U>> {
        self.tables
            .get(table_key.as_index())?
            .as_any()
            .downcast_ref()
    }

    pub fn table_mut<U: Item<T, K, V>>(&mut self, table_key: T) -> Option<&mut Table<T, K, V, U>> {
        self.tables
            .get_mut(table_key.as_index())?
            .as_any_mut()
            .downcast_mut()
    }

    /// Insert an item, or request its creation at its home rank.
    ///
    /// For a local key: find-and-refresh, create (`on_create` then
    /// `refresh`), or ignore, returning a reference to the user state. For
    /// a remote key with `is_remote && create_if_absent`: enqueue a
    /// synthetic self-sourced message so the home rank creates the item on
    /// the next cycle.
    pub fn add_item<U: Item<T, K, V>>(
        &mut self,
        table_key: T,
        item_key: K,
        is_remote: bool,
        create_if_absent: bool,
    ) -> (Option<&mut U>, ItemStatus) {
        if partition_of(&item_key, self.ranks) == self.rank {
            let index = table_key.as_index();
            assert!(index < self.tables.len(), "unknown table {table_key:?}");
            let table = self.tables[index]
                .as_any_mut()
                .downcast_mut::<Table<T, K, V, U>>()
                .expect("item type does not match the table's declared type");
            return table.add_local(item_key, create_if_absent, &mut self.outbox, self.cycles);
        }

        if create_if_absent && is_remote {
            self.outbox.enqueue(Message {
                value: V::default(),
                src_table: table_key,
                dest_table: table_key,
                dest_item: item_key,
                src_item: item_key,
            });
            return (None, ItemStatus::RequestedNewRemote);
        }

        (None, ItemStatus::IgnoredNewRemote)
    }

    /// Append one message to the outgoing buffer for its destination's
    /// partition. Delivered during the next communicating cycle.
    pub fn enqueue_push(&mut self, msg: Message<T, K, V>) {
        self.outbox.enqueue(msg);
    }

    pub fn cycle_once(&mut self) {
        self.cycle(1, true, true);
    }

    /// Run `iterations` cycles. Collective: every rank must call with the
    /// same arguments or the barriers deadlock.
    pub fn cycle(&mut self, iterations: usize, do_work: bool, do_comm: bool) {
        if !self.pool.is_resolved() {
            self.substrate.barrier();
            self.pool.resolve_peers(self.substrate.as_ref());
            trace!(
                rank = self.rank,
                all_direct = self.pool.all_direct(),
                "resolved peer buffer handles"
            );
        }

        for _ in 0..iterations {
            let started = Instant::now();
            let capacity = self.outbox.capacity() as u64;

            // Phase 0: quiesce. The counter snapshot is taken before the
            // barrier releases any peer into its exchange phase, so it
            // cannot race a receiver-side clear.
            for peer in 0..self.ranks {
                self.snapshot[peer] = self.outbox.count_value(peer);
            }
            self.substrate.progress();
            self.substrate.barrier();

            if do_comm {
                self.stats.sent = self.snapshot.iter().map(|&c| c.min(capacity)).sum();

                // Phase 1: validate.
                if self.local_root {
                    self.validate(capacity);
                }

                // Phase 2: exchange.
                if self.pool.all_direct() {
                    self.exchange_direct(capacity);
                } else {
                    self.exchange_staged(capacity);
                }

                // Everyone must be done reading before anything is cleared.
                self.substrate.barrier();

                // Phase 3: clear.
                self.outbox.clear();
                self.pool.clear_stage();
                self.last_stats = self.stats;
                self.stats = CycleStats::default();
            }

            // Phase 4: work.
            if do_work {
                self.work();
            }

            if do_comm {
                let line = self.last_stats;
                debug!(
                    rank = self.rank,
                    iter = self.cycles,
                    sent = line.sent,
                    recv_local = line.recv_local,
                    recv_remote = line.recv_remote,
                    buffer_min = line.buffer_min,
                    buffer_max = line.buffer_max,
                    recommended = line.recommended,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "cycle complete"
                );
            }

            self.cycles += 1;
        }
    }

    /// Scan the counter snapshot (and co-located receive counters) for
    /// overflow; record min/max and the recommended size.
    fn validate(&mut self, capacity: u64) {
        let mut min = self.snapshot[self.rank];
        let mut max = min;
        for &count in &self.snapshot {
            min = min.min(count);
            max = max.max(count);
        }
        for peer in 0..self.ranks {
            if let Some(direct) = self.pool.peer_direct(peer) {
                let count = direct.pending();
                min = min.min(count);
                max = max.max(count);
            }
        }

        self.stats.buffer_min = min;
        self.stats.buffer_max = max;
        self.stats.recommended = recommended_size(max);

        if max > capacity && self.error.is_none() {
            warn!(
                rank = self.rank,
                needed = self.stats.recommended,
                capacity,
                "out of buffer space; overflowed messages were dropped"
            );
            self.error = Some(WorkerError::NotEnoughBufferSpace);
        }
    }

    /// All-local fast path: every peer's send buffer is directly readable.
    /// Apply in place, then clear the peer's counter through the direct
    /// pointer (safe under the bracketing barriers).
    fn exchange_direct(&mut self, capacity: u64) {
        for peer in 0..self.ranks {
            let (slots, pending) = {
                let direct = self
                    .pool
                    .peer_direct(peer)
                    .expect("direct exchange requires fully resolved peers");
                (direct.slots(), direct.pending().min(capacity) as usize)
            };
            if pending > 0 {
                self.apply_buffer(slots, pending);
                self.stats.recv_local += pending as u64;
            }
            self.pool
                .peer_direct(peer)
                .expect("peer still resolved")
                .clear_pending();
            if peer % self.config.progress_interval == 0 {
                self.substrate.progress();
            }
        }
    }

    /// Remote path: overlap one-sided counter reads with local delivery,
    /// then pull each remote payload into its staging band and apply.
    fn exchange_staged(&mut self, capacity: u64) {
        let msg_size = self.pool.msg_size();

        // Step 1: issue counter reads for every staged peer.
        let mut counter_reads: Vec<Option<RgetTicket>> = Vec::with_capacity(self.ranks);
        for peer in 0..self.ranks {
            if self.pool.peer_direct(peer).is_some() {
                counter_reads.push(None);
            } else {
                let ticket = unsafe {
                    self.substrate.rget(
                        self.pool.peer_count_ref(peer),
                        self.pool.stage_count_dst(peer),
                        mem::size_of::<u64>(),
                    )
                };
                counter_reads.push(Some(ticket));
            }
            if peer % self.config.progress_interval == 0 {
                self.substrate.progress();
            }
        }

        // Step 2: while those are in flight, deliver from this rank and
        // from co-located peers, fast-path style.
        for peer in 0..self.ranks {
            if self.pool.peer_direct(peer).is_none() {
                continue;
            }
            let (slots, pending) = {
                let direct = self.pool.peer_direct(peer).expect("probed above");
                (direct.slots(), direct.pending().min(capacity) as usize)
            };
            if pending > 0 {
                self.apply_buffer(slots, pending);
                self.stats.recv_local += pending as u64;
            }
            self.pool
                .peer_direct(peer)
                .expect("peer still resolved")
                .clear_pending();
        }

        // Step 3: await each counter, then issue the payload read.
        let mut payload_reads: Vec<Option<(RgetTicket, usize)>> = Vec::with_capacity(self.ranks);
        for (peer, slot) in counter_reads.iter_mut().enumerate() {
            match slot.take() {
                None => payload_reads.push(None),
                Some(ticket) => {
                    self.substrate.rget_wait(ticket);
                    let pending = self.pool.stage_count_value(peer).min(capacity) as usize;
                    if pending == 0 {
                        payload_reads.push(None);
                        continue;
                    }
                    let ticket = unsafe {
                        self.substrate.rget(
                            self.pool.peer_slots_ref(peer),
                            self.pool.stage_slots_dst(peer),
                            pending * msg_size,
                        )
                    };
                    payload_reads.push(Some((ticket, pending)));
                }
            }
            if peer % self.config.progress_interval == 0 {
                self.substrate.progress();
            }
        }

        // Step 4: await each payload and deliver it.
        for (peer, entry) in payload_reads.into_iter().enumerate() {
            if let Some((ticket, pending)) = entry {
                self.substrate.rget_wait(ticket);
                self.apply_buffer(self.pool.stage_slots(peer), pending);
                self.stats.recv_remote += pending as u64;
            }
            if peer % self.config.progress_interval == 0 {
                self.substrate.progress();
            }
        }
    }

    /// Deliver `count` messages from a received buffer to their destination
    /// tables.
    fn apply_buffer(&mut self, slots: *const Message<T, K, V>, count: usize) {
        for i in 0..count {
            let msg = unsafe { slots.add(i).read() };
            let index = msg.dest_table.as_index();
            if index >= self.tables.len() {
                self.stats.malformed += 1;
                trace!(
                    rank = self.rank,
                    table = ?msg.dest_table,
                    item = ?msg.dest_item,
                    "dropping malformed message"
                );
                continue;
            }
            let status = self.tables[index].apply(
                &msg,
                self.config.create_on_push,
                &mut self.outbox,
                self.cycles,
            );
            if status == ItemStatus::IgnoredNewRemote {
                self.stats.misrouted += 1;
            }
            if i % self.config.progress_interval == 0 {
                self.substrate.progress();
            }
        }
    }

    /// Work phase: tables in declaration order, items in map order, the
    /// three work callbacks in order per item.
    fn work(&mut self) {
        for table in &mut self.tables {
            table.work(&mut self.outbox, self.cycles);
        }
    }
}
