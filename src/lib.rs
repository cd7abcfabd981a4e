//! Saddlebag: bulk-synchronous partitioned computation over symmetric
//! shared-memory segments.
//!
//! Applications declare typed items grouped into tables; the framework
//! places each item on a home rank by a hash of its key, buffers messages
//! between items in per-peer FIFOs living in registered shared memory, and
//! drives a synchronous cycle protocol (quiesce, validate, exchange, clear,
//! work) that delivers the buffers by direct pointer access on a node and
//! one-sided reads between nodes, then runs the user work callbacks.

pub mod hash;
pub mod item;
pub mod map;
pub mod message;
pub mod substrate;
pub mod table;
pub mod worker;

mod buffers;
mod error;

pub use error::WorkerError;
pub use hash::StableHash32;
pub use item::{Item, ItemCtx};
pub use map::OpenMap;
pub use message::{partition_of, ItemKey, Message, TableKey, Value};
pub use substrate::{GlobalRef, RgetTicket, Segment, SmpConfig, SmpRank, SmpWorld, Substrate};
pub use table::{ItemStatus, Table};
pub use worker::{
    CycleStats, SendingMode, Worker, WorkerBuilder, WorkerConfig, DEFAULT_BUFFER_SIZE,
};
