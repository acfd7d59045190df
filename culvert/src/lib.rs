//! A modular packet-tunneling engine
//!
//! Culvert moves byte streams and packets through per-connection chains of
//! tunnel nodes. Listeners accept traffic at a chain's head, connectors dial
//! out at its tail, and everything in between is an adapter that sees the
//! twelve chain operations and nothing else. Backpressure is explicit: a
//! node that cannot drain its transport parks payload and pauses the
//! producer until the write completes.
//!
//! The runtime is N worker threads, each owning a single-threaded tokio
//! event loop. A connection (a [`Line`]) is affine to the worker that
//! accepted it for its entire life; cross-thread traffic happens only
//! through the shared buffer pools and through events posted into a worker's
//! loop with full ownership transfer. Dedicated threads handle the blocking
//! edges: the socket acceptor and the TUN device reader/writer.
//!
//! The deterministic chain runtime itself (buffers, pools, lines, the
//! propagation protocol) lives in `culvert-core` and is re-exported here.
//!
//! Platform support: the engine targets Unix; TUN devices are Linux-only.

#![warn(missing_docs)]

mod acceptor;
mod engine;
mod sockio;
mod tun;
mod worker;

pub mod nodes;

pub use crate::acceptor::{FilterOptions, MultiportBackend};
pub use crate::engine::{
    Blueprint, BuildError, Engine, EngineConfig, NodeFactory, NodeRegistry, NodeSettings, NodeSpec,
};
pub use crate::tun::{TunDevice, TunError, TunReadCallback, TunWriteError};
pub use crate::worker::{WorkerCtx, WorkerHandle};

pub use culvert_core::{
    address, type_hash, BufferConfig, BufferPool, BufferQueue, Chain, ChainError, Ctx, Line,
    LineGuard, MasterPool, NodeMeta, PoolAllocator, ShiftBuf, Tunnel, WorkerId,
};
