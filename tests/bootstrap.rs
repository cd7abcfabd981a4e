// Construction-time behavior: segments, worlds, builder defaults, and the
// publish/fetch handshake that wires peers together.

use std::sync::Arc;
use std::thread;

use serial_test::serial;

use saddlebag::substrate::MemfdSegment;
use saddlebag::{
    GlobalRef, Item, ItemCtx, SendingMode, SmpConfig, SmpWorld, Substrate, Worker, WorkerBuilder,
};

#[derive(Default)]
struct Inert;

impl Item<u8, u32, u32> for Inert {
    fn on_push_recv(&mut self, _value: u32, _cx: &mut ItemCtx<'_, u8, u32, u32>) {}
}

#[test]
fn segment_is_zero_filled_and_writable() {
    let segment = MemfdSegment::create(4096, "saddlebag-test").unwrap();
    assert_eq!(segment.len(), 4096);
    let bytes = unsafe { std::slice::from_raw_parts_mut(segment.as_ptr(), segment.len()) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes[0] = 0xAB;
    bytes[4095] = 0xCD;
    assert_eq!(bytes[0], 0xAB);
    assert_eq!(bytes[4095], 0xCD);
}

#[test]
fn global_ref_advances_offset_only() {
    let base = GlobalRef {
        rank: 3,
        segment: 1,
        offset: 64,
    };
    let advanced = base.at(100);
    assert_eq!(advanced.rank, 3);
    assert_eq!(advanced.segment, 1);
    assert_eq!(advanced.offset, 164);
}

#[test]
fn world_reports_node_topology() {
    let world = SmpWorld::with_config(SmpConfig {
        ranks: 5,
        ranks_per_node: 2,
        direct_local: true,
    });
    assert_eq!(world.ranks(), 5);

    let r0 = world.rank(0);
    let r3 = world.rank(3);
    let r4 = world.rank(4);

    assert_eq!(r0.local_rank_me(), 0);
    assert_eq!(r0.local_rank_n(), 2);
    assert!(r0.local_contains(1));
    assert!(!r0.local_contains(2));

    assert_eq!(r3.local_rank_me(), 1);
    assert!(r3.local_contains(2));
    assert!(!r3.local_contains(4));

    // The trailing node holds the remainder.
    assert_eq!(r4.local_rank_me(), 0);
    assert_eq!(r4.local_rank_n(), 1);
}

#[test]
fn publish_fetch_and_rget_round_trip() {
    let world = SmpWorld::new(2);
    let owner = world.rank(0);
    let reader = world.rank(1);

    let segment = owner.alloc_segment(1024).unwrap();
    unsafe { segment.as_ptr().cast::<u64>().write(0x5EED) };
    owner.publish(segment.handle());

    let handle = reader.fetch(0);
    assert_eq!(handle, segment.handle());

    // Same node: resolvable to a direct pointer.
    let direct = reader.resolve(handle).unwrap();
    assert_eq!(unsafe { direct.cast::<u64>().as_ptr().read() }, 0x5EED);

    // One-sided read sees the same bytes.
    let mut landed = 0u64;
    let ticket = unsafe { reader.rget(handle, &mut landed as *mut u64 as *mut u8, 8) };
    reader.rget_wait(ticket);
    assert_eq!(landed, 0x5EED);
}

#[test]
fn resolution_honors_the_direct_local_switch() {
    let world = SmpWorld::with_config(SmpConfig {
        ranks: 2,
        ranks_per_node: 2,
        direct_local: false,
    });
    let owner = world.rank(0);
    let reader = world.rank(1);

    let segment = owner.alloc_segment(256).unwrap();
    owner.publish(segment.handle());

    // Own memory always resolves; a peer's never does with the switch off.
    assert!(owner.resolve(segment.handle()).is_some());
    assert!(reader.resolve(reader.fetch(0)).is_none());

    // The one-sided path still reaches it.
    unsafe { segment.as_ptr().cast::<u32>().write(99) };
    let mut landed = 0u32;
    let ticket = unsafe { reader.rget(segment.handle(), &mut landed as *mut u32 as *mut u8, 4) };
    reader.rget_wait(ticket);
    assert_eq!(landed, 99);
}

#[test]
fn builder_defaults_match_the_contract() {
    let config = saddlebag::WorkerConfig::default();
    assert_eq!(config.buffer_size, saddlebag::DEFAULT_BUFFER_SIZE);
    assert_eq!(config.buffer_size, 500);
    assert_eq!(config.mode, SendingMode::Combining);
    assert!(config.create_on_push);
}

#[test]
#[serial]
fn single_rank_worker_cycles_cleanly() {
    let world = SmpWorld::new(1);
    let endpoint = world.rank(0);
    let mut worker: Worker<u8, u32, u32> =
        WorkerBuilder::new().build(Arc::new(endpoint)).unwrap();
    worker.add_table::<Inert>(0, true);

    assert_eq!(worker.rank_me(), 0);
    assert_eq!(worker.rank_n(), 1);
    assert_eq!(worker.total_nodes(), 1);
    assert_eq!(worker.total_tables(), 1);

    worker.cycle_once();
    // Idle cycles without communication or work still advance the counter.
    worker.cycle(2, false, false);

    assert_eq!(worker.cycles(), 3);
    assert!(worker.error().is_none());
    let stats = worker.last_cycle_stats();
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.recv_local + stats.recv_remote, 0);
}

#[test]
#[serial]
fn workers_bootstrap_together_across_ranks() {
    let ranks = 3;
    let world = SmpWorld::new(ranks);
    let mut handles = Vec::new();
    for rank in 0..ranks {
        let endpoint = world.rank(rank);
        handles.push(thread::spawn(move || {
            let mut worker: Worker<u8, u32, u32> =
                WorkerBuilder::new().build(Arc::new(endpoint)).unwrap();
            worker.add_table::<Inert>(0, true);
            // Comm-only cycles run the full exchange over empty buffers.
            worker.cycle(2, false, true);
            (worker.rank_me(), worker.cycles(), worker.error())
        }));
    }
    for (rank, handle) in handles.into_iter().enumerate() {
        let (me, cycles, error) = handle.join().unwrap();
        assert_eq!(me, rank);
        assert_eq!(cycles, 2);
        assert!(error.is_none());
    }
}
