//! Deterministic chain-runtime logic for the culvert tunneling engine
//!
//! culvert-core contains the pieces of the engine that are independent of any
//! event loop or operating system facility: the padded [`ShiftBuf`] byte
//! buffer, the cross-thread [`MasterPool`] and per-worker [`BufferPool`], the
//! per-connection [`Line`] state, and the [`Tunnel`]/[`Chain`] propagation
//! protocol that moves payloads and lifecycle signals between nodes. It
//! contains no networking code and takes no timestamps from the operating
//! system, so every contract here can be exercised from plain unit tests.
//!
//! The most important types are [`Chain`], which owns an ordered set of
//! tunnel nodes and validates their composition, and [`Ctx`], the cursor
//! through which a node forwards work to its neighbors. Everything that
//! happens to one `Line` happens on the single worker thread that owns it;
//! the types enforce this by being `!Send`.

#![warn(missing_docs)]

use std::fmt;

mod buffer;
mod chain;
mod line;
mod pool;
mod queue;

pub mod address;

#[cfg(test)]
mod tests;

pub use buffer::ShiftBuf;
pub use chain::{type_hash, validate_chain, Chain, ChainError, Ctx, Layer, NodeMeta, Tunnel};
pub use line::{Line, LineGuard};
pub use pool::{BufferConfig, BufferPool, MasterPool, PoolAllocator};
pub use queue::BufferQueue;

/// Identifies one worker thread and its event loop
///
/// Lines, buffer pools, and chain instances are affine to a single worker;
/// the id is carried for logging and for cross-thread fan-out targeting.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

impl From<usize> for WorkerId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
