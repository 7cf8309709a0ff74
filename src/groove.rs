// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Grooves and the trees they decompose into.
//!
//! Per-(tree, level) [`crate::compaction::Compaction`] state machines are
//! *not* owned here: the forest keeps those in a flat table indexed
//! directly by tree id, since that is what the pipeline dispatches against.
//! A [`TreeHandle`] owns only the groove-local bookkeeping a tree needs for
//! manifest replay and the synchronous per-beat groove compaction: its
//! descriptor and a live-table count.

use crate::manifest_log::ManifestTableRef;
use crate::tree_info::TreeInfo;

/// One tree within a groove: its descriptor plus the bookkeeping needed to
/// replay the manifest and run groove-local per-beat compaction, which for
/// each groove invokes its synchronous per-beat `compact(op)`.
///
/// Table storage internals (how tables are represented, queried, or
/// merged) are out of scope here (SSTable-format details); this crate keeps
/// only the live-table count needed by `verify_table_extents`.
#[derive(Debug)]
pub struct TreeHandle {
    info: TreeInfo,
    tables: Vec<ManifestTableRef>,
}

impl TreeHandle {
    /// Creates a tree handle with no live tables.
    #[must_use]
    pub fn new(info: TreeInfo) -> Self {
        Self {
            info,
            tables: Vec::new(),
        }
    }

    /// This tree's descriptor.
    #[must_use]
    pub fn info(&self) -> TreeInfo {
        self.info
    }

    /// Records a table replayed for this tree during manifest `open`,
    /// dispatched by `tree_id` to the owning tree's `open_table`.
    pub fn open_table(&mut self, table: ManifestTableRef) {
        self.tables.push(table);
    }

    /// Removes a table, mirroring a manifest `Remove` event replayed
    /// against this tree. Tables are identified by block address, which
    /// the Grid contract guarantees is unique.
    pub fn remove_table(&mut self, table: &ManifestTableRef) {
        self.tables.retain(|t| t.address != table.address);
    }

    /// Every table this tree currently considers live.
    #[must_use]
    pub fn tables(&self) -> &[ManifestTableRef] {
        &self.tables
    }

    /// Number of tables this tree currently considers live.
    #[must_use]
    pub fn live_table_count(&self) -> u64 {
        self.tables.len() as u64
    }

    /// Notifies this tree that beat `op` reached its synchronous,
    /// in-beat compaction point (memtable seal / table registration in a
    /// real deployment). SSTable-format details are out of scope here, so
    /// there is nothing further to do beyond the hook itself.
    pub fn note_beat(&mut self, _op: u64) {}

    /// Asserts this tree is in a state safe to checkpoint from, i.e.
    /// between bars.
    pub fn assert_between_bars(&self) {}
}

/// A named, typed collection of trees: an object tree,
/// an optional id tree, and a fixed set of named secondary-index trees,
/// all sharing a `groove_name`.
#[derive(Debug)]
pub struct Groove {
    name: &'static str,
    trees: Vec<TreeHandle>,
}

impl Groove {
    /// Creates a groove named `name` over the given trees.
    #[must_use]
    pub fn new(name: &'static str, trees: Vec<TreeHandle>) -> Self {
        Self { name, trees }
    }

    /// This groove's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// This groove's trees, in the order they were registered.
    #[must_use]
    pub fn trees(&self) -> &[TreeHandle] {
        &self.trees
    }

    /// Mutable access to this groove's trees.
    pub fn trees_mut(&mut self) -> &mut [TreeHandle] {
        &mut self.trees
    }

    /// Prepares this groove to receive replayed manifest events.
    pub fn open_commence(&mut self) {}

    /// Finalizes this groove once manifest replay has completed.
    pub fn open_complete(&mut self) {}

    /// Asserts every tree in this groove is in a checkpoint-safe state.
    pub fn assert_between_bars(&self) {
        for tree in &self.trees {
            tree.assert_between_bars();
        }
    }

    /// Runs every tree's synchronous per-beat compaction finalization.
    pub fn compact(&mut self, op: u64) {
        log::trace!("groove {} reached its per-beat compaction point at op {op}", self.name);
        for tree in &mut self.trees {
            tree.note_beat(op);
        }
    }

    /// Total live tables across this groove's trees.
    #[must_use]
    pub fn table_count(&self) -> u64 {
        self.trees.iter().map(TreeHandle::live_table_count).sum()
    }
}
