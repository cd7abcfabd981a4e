// Per-peer message buffers in the registered shared segment.
//
// Layout, one segment per worker, carved with fixed 128-byte band
// alignment so peers can derive addresses from the segment base alone:
//
//   [PoolHeader][send_count[N]][send[N][M]][stage_count[N]][stage[N][M]]
//
// The send bands and counters are written only by the owning rank and read
// by peers during the exchange phase; the stage region is the landing zone
// for one-sided reads from peers that cannot be resolved to direct
// pointers, and is never touched by any other rank.

use std::io;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::message::{partition_of, ItemKey, Message};
use crate::substrate::{GlobalRef, Segment, Substrate};

/// Identifies a segment as a saddlebag buffer pool.
const POOL_MAGIC: u64 = 0x5344_4c42_4147_3031; // "SDLBAG01"
const POOL_VERSION: u32 = 1;

/// Band alignment within the segment.
const BAND_ALIGN: usize = 128;

type Counter = CachePadded<AtomicU64>;

/// Written at the base of every pool segment; peers that resolve a handle
/// to a direct pointer check it before trusting the derived layout.
#[repr(C)]
struct PoolHeader {
    magic: u64,
    version: u32,
    ranks: u32,
    capacity: u64,
}

const fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Byte offsets of the pool bands. Deterministic given (ranks, capacity,
/// message size), which is what lets a peer address this rank's buffers
/// from the published segment handle alone.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolLayout {
    counter_stride: usize,
    msg_size: usize,
    capacity: usize,
    send_counts: usize,
    send_band: usize,
    stage_counts: usize,
    stage_band: usize,
    total: usize,
}

impl PoolLayout {
    pub(crate) fn compute(ranks: usize, capacity: usize, msg_size: usize) -> PoolLayout {
        let counter_stride = mem::size_of::<Counter>();
        let send_counts = align_up(mem::size_of::<PoolHeader>(), BAND_ALIGN);
        let send_band = align_up(send_counts + ranks * counter_stride, BAND_ALIGN);
        let stage_counts = align_up(send_band + ranks * capacity * msg_size, BAND_ALIGN);
        let stage_band = align_up(stage_counts + ranks * counter_stride, BAND_ALIGN);
        let total = align_up(stage_band + ranks * capacity * msg_size, BAND_ALIGN);
        PoolLayout {
            counter_stride,
            msg_size,
            capacity,
            send_counts,
            send_band,
            stage_counts,
            stage_band,
            total,
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    fn send_count_offset(&self, peer: usize) -> usize {
        self.send_counts + peer * self.counter_stride
    }

    fn send_band_offset(&self, peer: usize) -> usize {
        self.send_band + peer * self.capacity * self.msg_size
    }

    fn stage_count_offset(&self, peer: usize) -> usize {
        self.stage_counts + peer * self.counter_stride
    }

    fn stage_band_offset(&self, peer: usize) -> usize {
        self.stage_band + peer * self.capacity * self.msg_size
    }
}

/// The owned send side: one FIFO array plus one counter per peer.
///
/// Single writer (the owning rank). The counter is allowed to climb past
/// the capacity: overflowed messages are dropped from the array while the
/// counter keeps recording demand, so validation can recommend a size.
pub(crate) struct SendBuffers<T, K, V> {
    rank: usize,
    ranks: usize,
    capacity: usize,
    counts: NonNull<Counter>,
    slots: NonNull<Message<T, K, V>>,
}

impl<T, K: ItemKey, V> SendBuffers<T, K, V> {
    /// Safety: `segment` must hold `layout` with the send bands zeroed, and
    /// must outlive the returned value.
    unsafe fn from_segment(
        segment: &Segment,
        layout: &PoolLayout,
        rank: usize,
        ranks: usize,
    ) -> Self {
        let base = segment.as_ptr();
        SendBuffers {
            rank,
            ranks,
            capacity: layout.capacity,
            counts: NonNull::new_unchecked(base.add(layout.send_counts) as *mut Counter),
            slots: NonNull::new_unchecked(base.add(layout.send_band) as *mut Message<T, K, V>),
        }
    }

    #[inline]
    pub(crate) fn rank_me(&self) -> usize {
        self.rank
    }

    #[inline]
    pub(crate) fn rank_n(&self) -> usize {
        self.ranks
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn count(&self, peer: usize) -> &Counter {
        debug_assert!(peer < self.ranks);
        unsafe { &*self.counts.as_ptr().add(peer) }
    }

    /// Append one message to the buffer for its destination's partition.
    /// Past capacity the message is dropped but the counter still climbs,
    /// signaling overflow to the next validation scan.
    pub(crate) fn enqueue(&mut self, msg: Message<T, K, V>) {
        let dest = partition_of(&msg.dest_item, self.ranks);
        let counter = self.count(dest);
        let pending = counter.load(Ordering::Relaxed);
        if (pending as usize) < self.capacity {
            unsafe {
                self.slots
                    .as_ptr()
                    .add(dest * self.capacity + pending as usize)
                    .write(msg);
            }
        }
        counter.store(pending + 1, Ordering::Release);
    }

    pub(crate) fn count_value(&self, peer: usize) -> u64 {
        self.count(peer).load(Ordering::Relaxed)
    }

    /// Zero every send counter. Runs in the clear phase, after the
    /// post-exchange barrier, so no peer can still be reading.
    pub(crate) fn clear(&mut self) {
        for peer in 0..self.ranks {
            self.count(peer).store(0, Ordering::Release);
        }
    }
}

/// Direct pointers to a peer's buffer targeted at this rank, available when
/// the peer's segment maps into this address space.
pub(crate) struct PeerDirect<T, K, V> {
    count: NonNull<Counter>,
    slots: NonNull<Message<T, K, V>>,
}

impl<T, K, V> PeerDirect<T, K, V> {
    #[inline]
    pub(crate) fn pending(&self) -> u64 {
        unsafe { (*self.count.as_ptr()).load(Ordering::Acquire) }
    }

    #[inline]
    pub(crate) fn slots(&self) -> *const Message<T, K, V> {
        self.slots.as_ptr()
    }

    /// Clear the peer's counter through the direct pointer. Only valid
    /// inside the exchange phase, between the bracketing barriers.
    #[inline]
    pub(crate) fn clear_pending(&self) {
        unsafe { (*self.count.as_ptr()).store(0, Ordering::Release) };
    }
}

struct Peer<T, K, V> {
    handle: GlobalRef,
    direct: Option<PeerDirect<T, K, V>>,
}

/// The full buffer pool: the owned segment, the resolved peer directory,
/// and the staging region for one-sided reads.
pub(crate) struct BufferPool<T, K, V> {
    segment: Segment,
    layout: PoolLayout,
    rank: usize,
    ranks: usize,
    peers: Vec<Peer<T, K, V>>,
    resolved: bool,
    all_direct: bool,
}

impl<T, K: ItemKey, V> BufferPool<T, K, V> {
    /// Register the pool segment, publish its handle, and hand back the
    /// send side. Peer handles are resolved on the first cycle.
    pub(crate) fn create(
        substrate: &dyn Substrate,
        capacity: usize,
    ) -> io::Result<(BufferPool<T, K, V>, SendBuffers<T, K, V>)> {
        let rank = substrate.rank_me();
        let ranks = substrate.rank_n();
        let msg_size = mem::size_of::<Message<T, K, V>>();
        assert!(
            mem::align_of::<Message<T, K, V>>() <= BAND_ALIGN,
            "message alignment exceeds band alignment"
        );
        let layout = PoolLayout::compute(ranks, capacity, msg_size);

        let segment = substrate.alloc_segment(layout.total())?;
        // A fresh mapping is zero-filled, so every counter starts at zero;
        // only the header needs writing.
        unsafe {
            (segment.as_ptr() as *mut PoolHeader).write(PoolHeader {
                magic: POOL_MAGIC,
                version: POOL_VERSION,
                ranks: ranks as u32,
                capacity: capacity as u64,
            });
        }
        substrate.publish(segment.handle());

        let send = unsafe { SendBuffers::from_segment(&segment, &layout, rank, ranks) };
        let pool = BufferPool {
            segment,
            layout,
            rank,
            ranks,
            peers: Vec::with_capacity(ranks),
            resolved: false,
            all_direct: false,
        };
        Ok((pool, send))
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Fetch every peer's published handle and resolve co-located ones to
    /// direct pointers. Collective: all ranks must already have published.
    pub(crate) fn resolve_peers(&mut self, substrate: &dyn Substrate) {
        debug_assert!(!self.resolved);
        for peer in 0..self.ranks {
            let handle = substrate.fetch(peer);
            let direct = substrate.resolve(handle).map(|base| {
                let base = base.as_ptr();
                let header = unsafe { &*(base as *const PoolHeader) };
                assert_eq!(header.magic, POOL_MAGIC, "peer segment is not a buffer pool");
                assert_eq!(header.version, POOL_VERSION, "peer pool layout version mismatch");
                assert_eq!(header.ranks as usize, self.ranks, "peer pool rank count mismatch");
                assert_eq!(
                    header.capacity as usize, self.layout.capacity,
                    "peer pool capacity mismatch"
                );
                unsafe {
                    PeerDirect {
                        count: NonNull::new_unchecked(
                            base.add(self.layout.send_count_offset(self.rank)) as *mut Counter,
                        ),
                        slots: NonNull::new_unchecked(
                            base.add(self.layout.send_band_offset(self.rank))
                                as *mut Message<T, K, V>,
                        ),
                    }
                }
            });
            self.peers.push(Peer { handle, direct });
            substrate.progress();
        }
        self.all_direct = self.peers.iter().all(|p| p.direct.is_some());
        self.resolved = true;
    }

    /// Whether every peer resolved to a direct pointer (single-node run
    /// with direct access permitted).
    pub(crate) fn all_direct(&self) -> bool {
        self.all_direct
    }

    pub(crate) fn peer_direct(&self, peer: usize) -> Option<&PeerDirect<T, K, V>> {
        self.peers[peer].direct.as_ref()
    }

    /// Globally addressable reference to `peer`'s send counter targeted at
    /// this rank.
    pub(crate) fn peer_count_ref(&self, peer: usize) -> GlobalRef {
        self.peers[peer]
            .handle
            .at(self.layout.send_count_offset(self.rank) as u64)
    }

    /// Globally addressable reference to `peer`'s send band targeted at
    /// this rank.
    pub(crate) fn peer_slots_ref(&self, peer: usize) -> GlobalRef {
        self.peers[peer]
            .handle
            .at(self.layout.send_band_offset(self.rank) as u64)
    }

    fn stage_count(&self, peer: usize) -> &Counter {
        unsafe {
            &*(self
                .segment
                .as_ptr()
                .add(self.layout.stage_count_offset(peer)) as *const Counter)
        }
    }

    /// Landing address for a one-sided read of `peer`'s counter.
    pub(crate) fn stage_count_dst(&self, peer: usize) -> *mut u8 {
        unsafe { self.segment.as_ptr().add(self.layout.stage_count_offset(peer)) }
    }

    pub(crate) fn stage_count_value(&self, peer: usize) -> u64 {
        self.stage_count(peer).load(Ordering::Relaxed)
    }

    /// Landing address for a one-sided read of `peer`'s message band.
    pub(crate) fn stage_slots_dst(&self, peer: usize) -> *mut u8 {
        unsafe { self.segment.as_ptr().add(self.layout.stage_band_offset(peer)) }
    }

    pub(crate) fn stage_slots(&self, peer: usize) -> *const Message<T, K, V> {
        self.stage_slots_dst(peer) as *const Message<T, K, V>
    }

    pub(crate) fn msg_size(&self) -> usize {
        self.layout.msg_size
    }

    /// Zero the staging counters for the next cycle.
    pub(crate) fn clear_stage(&mut self) {
        for peer in 0..self.ranks {
            self.stage_count(peer).store(0, Ordering::Relaxed);
        }
    }
}
