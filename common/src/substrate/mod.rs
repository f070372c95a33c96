//! Asynchronous I/O substrate consumed by the copy pipeline
//!
//! The pipeline never performs I/O itself. It hands a [`Block`] to the substrate together with
//! the handle to operate on, and later receives the same block back inside an [`Event`] once the
//! operation finished. Submissions must not block; the substrate does the work out of band.
//!
//! # Result encoding
//!
//! `Event::result` is the number of bytes transferred when non-negative. A negative value is a
//! negated OS error code, with [`TRY_AGAIN`] meaning the operation should be resubmitted
//! unchanged.

pub mod local;

pub use local::LocalSubstrate;

use crate::block::Block;

/// Negated `EAGAIN`: resubmit the same request.
pub const TRY_AGAIN: i64 = -(libc::EAGAIN as i64);

/// Opaque reference to a file opened through a substrate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Completion handler registered for a handle. Every event produced by operations on that
/// handle is tagged with it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Read,
    Write,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Read => write!(f, "read"),
            Route::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    /// The substrate itself failed to carry out the operation; `result` is meaningless.
    Error,
}

#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    pub route: Route,
    pub result: i64,
    pub block: Block,
}

pub trait Substrate {
    fn open_for_read(&mut self, path: &std::path::Path) -> anyhow::Result<Handle>;

    /// Creates the destination. Without `overwrite` an existing file is an error, with it the
    /// file is truncated.
    fn create_for_write(&mut self, path: &std::path::Path, overwrite: bool)
    -> anyhow::Result<Handle>;

    fn register_completion_handler(&mut self, handle: Handle, route: Route) -> anyhow::Result<()>;

    /// Number of bytes that can be read from `handle`: the length of a regular file or the
    /// size of a block device.
    fn probe_size(&mut self, handle: Handle) -> anyhow::Result<u64>;

    /// Queues a read of `block.remaining()` bytes at `block.offset()` into `block.pending_mut()`.
    fn submit_read(&mut self, handle: Handle, block: Block) -> anyhow::Result<()>;

    /// Queues a write of `block.pending()` at `block.offset()`.
    fn submit_write(&mut self, handle: Handle, block: Block) -> anyhow::Result<()>;

    /// Waits for the next completed operation. `None` means no further events will arrive.
    fn wait_for_next_event(&mut self) -> impl std::future::Future<Output = Option<Event>>;

    fn close(&mut self, handle: Handle) -> anyhow::Result<()>;
}
