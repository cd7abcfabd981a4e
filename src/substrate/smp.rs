// SMP substrate: the ranks of one machine as threads over shared segments.
//
// Each rank allocates genuine memfd-backed mappings; "one-sided" reads are
// transport-level copies out of the owner's mapping. The `direct_local`
// switch controls whether peers on the same node may resolve handles to
// direct pointers; turning it off forces the staged rget path between
// co-resident ranks, which is how the remote protocol is exercised without
// a network.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::futex::{futex_wait, futex_wake_all};
use super::segment::MemfdSegment;
use super::{GlobalRef, RgetTicket, Segment, Substrate};

/// World shape: rank count, node grouping, and local resolution policy.
#[derive(Clone, Copy, Debug)]
pub struct SmpConfig {
    pub ranks: usize,
    /// Ranks per node; consecutive ranks share a node. The last node may be
    /// smaller.
    pub ranks_per_node: usize,
    /// Permit resolving same-node handles to direct pointers. Off forces
    /// the staged one-sided path between all distinct ranks.
    pub direct_local: bool,
}

impl SmpConfig {
    /// Everything on one node, direct access allowed.
    pub fn single_node(ranks: usize) -> Self {
        SmpConfig {
            ranks,
            ranks_per_node: ranks,
            direct_local: true,
        }
    }
}

/// Centralized sense-reversing barrier: the last arrival resets the count,
/// bumps the generation and wakes the waiters.
struct FutexBarrier {
    total: u32,
    count: AtomicU32,
    generation: AtomicU32,
}

impl FutexBarrier {
    fn new(total: usize) -> Self {
        FutexBarrier {
            total: total as u32,
            count: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    fn wait(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 == self.total {
            // Reset before release: late arrivals of the next epoch only
            // run after observing the generation bump.
            self.count.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::Release);
            futex_wake_all(&self.generation);
        } else {
            let mut spins = 0u32;
            while self.generation.load(Ordering::Acquire) == generation {
                spins += 1;
                if spins < 64 {
                    std::hint::spin_loop();
                } else {
                    futex_wait(&self.generation, generation);
                }
            }
        }
    }
}

struct WorldShared {
    config: SmpConfig,
    global_barrier: FutexBarrier,
    node_barriers: Vec<FutexBarrier>,
    /// Per-rank registered segments. Segments are only ever appended and
    /// live until the world drops, so pointers into their mappings stay
    /// valid for every rank's lifetime.
    registry: Vec<Mutex<Vec<MemfdSegment>>>,
    published: Vec<OnceLock<GlobalRef>>,
}

impl WorldShared {
    #[inline]
    fn node_of(&self, rank: usize) -> usize {
        rank / self.config.ranks_per_node
    }

    fn node_size(&self, node: usize) -> usize {
        let start = node * self.config.ranks_per_node;
        self.config.ranks_per_node.min(self.config.ranks - start)
    }

    /// Local address of a handle's target, regardless of resolution policy.
    /// Bounds-checked against the owning segment.
    fn locate(&self, handle: GlobalRef, len: usize) -> NonNull<u8> {
        let segments = self.registry[handle.rank as usize].lock();
        let segment = &segments[handle.segment as usize];
        assert!(
            handle.offset as usize + len <= segment.len(),
            "global reference escapes its segment"
        );
        // The mapping never moves or unmaps before the world drops, so the
        // pointer may outlive the registry lock.
        unsafe { NonNull::new_unchecked(segment.as_ptr().add(handle.offset as usize)) }
    }
}

/// A fixed-size world of cooperating ranks. Create once, then hand each
/// spawned thread its [`SmpRank`].
pub struct SmpWorld {
    shared: Arc<WorldShared>,
}

impl SmpWorld {
    pub fn new(ranks: usize) -> Self {
        Self::with_config(SmpConfig::single_node(ranks))
    }

    pub fn with_config(config: SmpConfig) -> Self {
        assert!(config.ranks > 0, "world needs at least one rank");
        assert!(config.ranks_per_node > 0, "nodes need at least one rank");
        let nodes = config.ranks.div_ceil(config.ranks_per_node);
        let shared = WorldShared {
            config,
            global_barrier: FutexBarrier::new(config.ranks),
            node_barriers: (0..nodes)
                .map(|node| {
                    let start = node * config.ranks_per_node;
                    FutexBarrier::new(config.ranks_per_node.min(config.ranks - start))
                })
                .collect(),
            registry: (0..config.ranks).map(|_| Mutex::new(Vec::new())).collect(),
            published: (0..config.ranks).map(|_| OnceLock::new()).collect(),
        };
        SmpWorld {
            shared: Arc::new(shared),
        }
    }

    pub fn ranks(&self) -> usize {
        self.shared.config.ranks
    }

    /// The substrate endpoint for one rank.
    pub fn rank(&self, rank: usize) -> SmpRank {
        assert!(rank < self.shared.config.ranks, "rank out of range");
        SmpRank {
            shared: Arc::clone(&self.shared),
            rank,
        }
    }
}

/// One rank's view of an [`SmpWorld`].
pub struct SmpRank {
    shared: Arc<WorldShared>,
    rank: usize,
}

impl Substrate for SmpRank {
    fn rank_me(&self) -> usize {
        self.rank
    }

    fn rank_n(&self) -> usize {
        self.shared.config.ranks
    }

    fn local_contains(&self, rank: usize) -> bool {
        self.shared.node_of(rank) == self.shared.node_of(self.rank)
    }

    fn local_rank_me(&self) -> usize {
        self.rank - self.shared.node_of(self.rank) * self.shared.config.ranks_per_node
    }

    fn local_rank_n(&self) -> usize {
        self.shared.node_size(self.shared.node_of(self.rank))
    }

    fn barrier(&self) {
        self.shared.global_barrier.wait();
    }

    fn barrier_local(&self) {
        self.shared.node_barriers[self.shared.node_of(self.rank)].wait();
    }

    fn progress(&self) {
        // Ranks share an address space; one-sided reads complete eagerly
        // and need no servicing.
        std::hint::spin_loop();
    }

    fn alloc_segment(&self, len: usize) -> io::Result<Segment> {
        let name = format!("saddlebag-rank{}", self.rank);
        let backing = MemfdSegment::create(len, &name)?;
        let ptr = NonNull::new(backing.as_ptr())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "segment mapped at null"))?;
        let mut segments = self.shared.registry[self.rank].lock();
        let index = segments.len();
        segments.push(backing);
        Ok(Segment::new(
            GlobalRef {
                rank: self.rank as u32,
                segment: index as u32,
                offset: 0,
            },
            ptr,
            len,
        ))
    }

    fn publish(&self, handle: GlobalRef) {
        self.shared.published[self.rank]
            .set(handle)
            .expect("rank published a handle twice");
    }

    fn fetch(&self, rank: usize) -> GlobalRef {
        loop {
            if let Some(handle) = self.shared.published[rank].get() {
                return *handle;
            }
            std::thread::yield_now();
        }
    }

    fn resolve(&self, handle: GlobalRef) -> Option<NonNull<u8>> {
        let owner = handle.rank as usize;
        let reachable = owner == self.rank
            || (self.shared.config.direct_local && self.local_contains(owner));
        if !reachable {
            return None;
        }
        Some(self.shared.locate(handle, 0))
    }

    unsafe fn rget(&self, src: GlobalRef, dst: *mut u8, len: usize) -> RgetTicket {
        let from = self.shared.locate(src, len);
        std::ptr::copy_nonoverlapping(from.as_ptr(), dst, len);
        RgetTicket(0)
    }

    fn rget_wait(&self, _ticket: RgetTicket) {}
}
