// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The Forest: top-level LSM-tree orchestration layer of a deterministic,
//! single-node storage engine used by a replicated state machine.
//!
//! The Forest owns a fixed set of *grooves* (typed object collections), each
//! decomposed into multiple *trees* (object tree, optional id tree, and
//! named secondary-index trees). Its hardest responsibility, and the sole
//! subject of this crate, is the **compaction pipeline**: a three-stage
//! (read → merge → write) scheduler that advances many per-(tree, level)
//! compactions concurrently over a fixed block-memory budget, paced by a
//! discrete beat/bar clock so compaction work is amortised across the
//! operations of the surrounding consensus layer.
//!
//! ##### Scope
//!
//! This crate does not implement query execution, SSTable-format details,
//! manifest-log internals, grid crash recovery, or a wire protocol. The
//! [`Grid`](grid::Grid), [`ManifestLog`](manifest_log::ManifestLog), and
//! per-tree [`Compaction`](compaction::Compaction) state machines are
//! external collaborators, expressed here as traits with no concrete
//! storage-engine implementation behind them — a real deployment supplies
//! its own.
//!
//! # Example
//!
//! ```
//! use forest::compaction::{BlipCallback, BlipOutcome, Compaction, CompactionInfo};
//! use forest::compaction::block_pool::{BlockRange, CompactionBlocks};
//! use forest::config::ForestOptions;
//! use forest::grid::{Grid, GridCallback, NextTickCallback, ReadRequest, WriteRequest};
//! use forest::manifest_log::{ManifestEvent, ManifestLog, ManifestProgress, ManifestTableRef};
//! use forest::tree_info::{TreeInfo, TreeKind};
//! use forest::{Forest, GrooveSpec};
//! use std::cell::{Cell, RefCell};
//! use std::collections::VecDeque;
//! use std::rc::Rc;
//!
//! struct ImmediateGrid {
//!     ticks: VecDeque<NextTickCallback>,
//! }
//!
//! impl Grid for ImmediateGrid {
//!     fn read(&mut self, _request: ReadRequest, callback: GridCallback) {
//!         callback();
//!     }
//!     fn write(&mut self, _request: WriteRequest, callback: GridCallback) {
//!         callback();
//!     }
//!     fn on_next_tick(&mut self, callback: NextTickCallback) {
//!         self.ticks.push_back(callback);
//!     }
//!     fn assert_only_repairing(&self) {}
//! }
//!
//! struct NoopCompaction;
//!
//! impl Compaction for NoopCompaction {
//!     fn bar_setup(&mut self, _op: u64) -> Option<CompactionInfo> {
//!         None
//!     }
//!     fn bar_setup_budget(&mut self, _beats_per_bar: u32, _scratch_blocks: [BlockRange; 2]) {}
//!     fn bar_finish(&mut self, _op: u64) {}
//!     fn beat_grid_acquire(&mut self) {}
//!     fn beat_grid_forfeit(&mut self) {}
//!     fn beat_blocks_assign(&mut self, _blocks: CompactionBlocks) {}
//!     fn blip_read(&mut self, callback: BlipCallback) {
//!         callback(BlipOutcome::default());
//!     }
//!     fn blip_merge(&mut self, callback: BlipCallback) {
//!         callback(BlipOutcome::default());
//!     }
//!     fn blip_write(&mut self, callback: BlipCallback) {
//!         callback(BlipOutcome::default());
//!     }
//! }
//!
//! struct NoopManifestLog;
//!
//! impl ManifestLog for NoopManifestLog {
//!     fn open(&mut self, _on_event: Box<dyn FnMut(ManifestEvent)>, on_done: Box<dyn FnOnce()>) {
//!         on_done();
//!     }
//!     fn compact(&mut self, _op: u64, on_done: Box<dyn FnOnce()>) {
//!         on_done();
//!     }
//!     fn compact_end(&mut self) {}
//!     fn checkpoint(&mut self, on_done: Box<dyn FnOnce()>) {
//!         on_done();
//!     }
//!     fn progress(&self) -> ManifestProgress {
//!         ManifestProgress::Idle
//!     }
//!     fn table_extents_count(&self) -> usize {
//!         0
//!     }
//!     fn tables_latest(&self) -> Vec<ManifestTableRef> {
//!         Vec::new()
//!     }
//! }
//!
//! let grid = Rc::new(RefCell::new(ImmediateGrid { ticks: VecDeque::new() }));
//! let manifest_log: Rc<RefCell<dyn ManifestLog>> = Rc::new(RefCell::new(NoopManifestLog));
//!
//! let accounts_objects = TreeInfo {
//!     tree_id: 1,
//!     tree_name: "accounts.objects",
//!     groove_name: "accounts",
//!     kind: TreeKind::Objects,
//! };
//!
//! let forest = Forest::new(
//!     grid.clone(),
//!     manifest_log,
//!     ForestOptions::default().lsm_batch_multiple(4),
//!     /* node_pool_capacity */ 1024,
//!     /* scan_buffer_pool_capacity */ 1024,
//!     vec![GrooveSpec { name: "accounts", trees: vec![accounts_objects] }],
//!     |_info, _level_b| -> Rc<RefCell<dyn Compaction>> { Rc::new(RefCell::new(NoopCompaction)) },
//! )
//! .expect("forest construction should succeed");
//!
//! let opened = Rc::new(Cell::new(false));
//! let opened_flag = opened.clone();
//! forest.open(Box::new(move || opened_flag.set(true)));
//! assert!(opened.get());
//!
//! let compacted = Rc::new(Cell::new(false));
//! let compacted_flag = compacted.clone();
//! forest.compact(1, Box::new(move || compacted_flag.set(true)));
//! while let Some(cb) = grid.borrow_mut().ticks.pop_front() {
//!     cb();
//! }
//! assert!(compacted.get());
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]

pub mod bitset;
pub mod compaction;
pub mod config;
pub mod error;
pub mod forest;
pub mod grid;
pub mod groove;
pub mod manifest_log;
pub mod node_pool;
pub mod scan_buffer_pool;
pub mod tree_info;
pub mod verify;

pub use config::ForestOptions;
pub use error::{Error, Result};
pub use forest::{Forest, GrooveSpec, Progress};
