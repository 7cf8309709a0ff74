// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The block-addressed storage Grid: an external collaborator owned by the
//! forest.
//!
//! This crate does not re-specify the Grid's read/write/recovery semantics
//! (crash recovery of the grid is out of scope here). The trait here exists
//! only so the pipeline and per-tree compactions have something concrete to
//! schedule against; a real deployment supplies its own implementation.

/// A completion callback for a single Grid operation.
pub type GridCallback = Box<dyn FnOnce()>;

/// A completion callback for [`Grid::on_next_tick`].
pub type NextTickCallback = Box<dyn FnOnce()>;

/// Identifies a block on durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddress(pub u64);

/// A request to read a single block.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    /// Address of the block to read.
    pub address: BlockAddress,
}

/// A request to write a single block.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest {
    /// Address of the block to write.
    pub address: BlockAddress,
}

/// The block-addressed storage abstraction.
///
/// All operations are asynchronous: completion is signalled via the given
/// callback, which may fire synchronously (before the call returns) or be
/// deferred to a later tick, at the implementation's discretion. Callers
/// must not assume either.
pub trait Grid {
    /// Issues a read of a single block.
    fn read(&mut self, request: ReadRequest, callback: GridCallback);

    /// Issues a write of a single block.
    fn write(&mut self, request: WriteRequest, callback: GridCallback);

    /// Schedules `callback` to run on a future tick of the surrounding
    /// replica's event loop. Used by the pipeline to preserve tick
    /// discipline on the empty-beat fast path.
    fn on_next_tick(&mut self, callback: NextTickCallback);

    /// Asserts the grid is only performing repair I/O (no ordinary reads or
    /// writes in flight). Required before `Forest::checkpoint`.
    ///
    /// # Panics
    ///
    /// Implementations should panic if the assertion does not hold; this is
    /// a fatal invariant violation, not a recoverable error.
    fn assert_only_repairing(&self);
}
