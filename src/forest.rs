// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The top-level coordinator: owns the grooves, manifest log, node pool,
//! scan buffer pool, and pipeline, and sequences `open`, `compact(op)`,
//! and `checkpoint`.

use crate::compaction::pipeline::{self, Pipeline, PipelineHandle};
use crate::compaction::{Compaction, CompactionInterface};
use crate::config::ForestOptions;
use crate::error::Result;
use crate::grid::Grid;
use crate::groove::{Groove, TreeHandle};
use crate::manifest_log::{ManifestEvent, ManifestLog, ManifestProgress};
use crate::node_pool::NodePool;
use crate::scan_buffer_pool::ScanBufferPool;
use crate::tree_info::{TreeInfo, TreeRegistry};
use std::cell::RefCell;
use std::rc::Rc;

/// One groove's worth of tree descriptors, as supplied to [`Forest::new`].
/// A runtime stand-in for what a schema compiler would otherwise fix at
/// compile time.
pub struct GrooveSpec {
    /// This groove's name.
    pub name: &'static str,
    /// This groove's trees (object tree, optional id tree, named indexes).
    pub trees: Vec<TreeInfo>,
}

/// The forest's top-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No operation in flight.
    Idle,
    /// `open` is in flight.
    Open,
    /// `checkpoint` is in flight.
    Checkpoint,
    /// `compact(op)` is in flight.
    Compact {
        /// The operation number being compacted.
        op: u64,
    },
}

struct ForestInner {
    // Declared in reverse-of-creation order so that `ForestInner`'s
    // default field-order `Drop` tears resources down in the right order:
    // scan buffer pool, then pipeline, then node pool, then manifest log,
    // then grooves. The grid is never torn down here — it is supplied
    // externally and outlives the forest.
    scan_buffer_pool: ScanBufferPool,
    pipeline: PipelineHandle,
    node_pool: NodePool,
    manifest_log: Rc<RefCell<dyn ManifestLog>>,
    grooves: Vec<Groove>,

    /// Per-(tree, level) compaction state machines, dense-indexed by
    /// `(tree_id - tree_id_min, level_b)` — the table the pipeline
    /// dispatches against.
    compactions: Vec<Vec<Rc<RefCell<dyn Compaction>>>>,
    /// `tree_id - tree_id_min` → `(groove index, tree index within groove)`,
    /// used to dispatch manifest replay events to their owning tree.
    tree_lookup: Vec<Option<(usize, usize)>>,
    tree_registry: TreeRegistry,
    grid: Rc<RefCell<dyn Grid>>,
    options: ForestOptions,
    progress: Progress,
    compactions_running: u32,
    pending_compact_callback: Option<Box<dyn FnOnce()>>,
}

impl ForestInner {
    fn tree_handle_mut(&mut self, tree_id: u16) -> Option<&mut TreeHandle> {
        let dense_idx = usize::from(tree_id.checked_sub(self.tree_registry.tree_id_min())?);
        let (groove_idx, tree_idx) = (*self.tree_lookup.get(dense_idx)?)?;
        self.grooves.get_mut(groove_idx)?.trees_mut().get_mut(tree_idx)
    }

    fn compaction_at(&self, tree_id: u16, level_b: u8) -> Rc<RefCell<dyn Compaction>> {
        let dense_idx = usize::from(tree_id - self.tree_registry.tree_id_min());
        Rc::clone(&self.compactions[dense_idx][usize::from(level_b)])
    }
}

/// The forest coordinator.
///
/// A cheaply-cloneable handle over shared, single-threaded interior state:
/// every method takes `&self` and briefly borrows the inner state, mirroring
/// the teardown and compaction-callback style this crate uses throughout to
/// avoid holding a borrow across a call into external code or a
/// user-supplied callback.
#[derive(Clone)]
pub struct Forest(Rc<RefCell<ForestInner>>);

impl Forest {
    /// Constructs a forest over the given grooves, allocating its pipeline,
    /// node pool, and scan buffer pool, and asking `compaction_factory` for
    /// one [`Compaction`] per `(tree, level_b)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree descriptors across all grooves violate
    /// the `tree_id` uniqueness/contiguity invariant.
    pub fn new(
        grid: Rc<RefCell<dyn Grid>>,
        manifest_log: Rc<RefCell<dyn ManifestLog>>,
        options: ForestOptions,
        node_pool_capacity: usize,
        scan_buffer_pool_capacity: usize,
        groove_specs: Vec<GrooveSpec>,
        mut compaction_factory: impl FnMut(TreeInfo, u8) -> Rc<RefCell<dyn Compaction>>,
    ) -> Result<Self> {
        let all_infos: Vec<TreeInfo> = groove_specs
            .iter()
            .flat_map(|spec| spec.trees.iter().copied())
            .collect();
        let tree_registry = TreeRegistry::build(all_infos)?;

        let lsm_levels = options.lsm_levels;
        let mut compactions = Vec::with_capacity(tree_registry.len());
        for tree_id in tree_registry.tree_id_min()..=tree_registry.tree_id_max() {
            let info = *tree_registry
                .tree_for_id(tree_id)
                .expect("tree registry is dense over its id range");
            let levels = (0..lsm_levels)
                .map(|level_b| compaction_factory(info, level_b))
                .collect();
            compactions.push(levels);
        }

        let mut tree_lookup: Vec<Option<(usize, usize)>> = vec![None; tree_registry.len()];
        let mut grooves = Vec::with_capacity(groove_specs.len());
        for (groove_idx, spec) in groove_specs.into_iter().enumerate() {
            let mut trees = Vec::with_capacity(spec.trees.len());
            for (tree_idx, info) in spec.trees.into_iter().enumerate() {
                let dense_idx = usize::from(info.tree_id - tree_registry.tree_id_min());
                tree_lookup[dense_idx] = Some((groove_idx, tree_idx));
                trees.push(TreeHandle::new(info));
            }
            grooves.push(Groove::new(spec.name, trees));
        }

        let pipeline = Pipeline::new(Rc::clone(&grid), tree_registry.len() * usize::from(lsm_levels));

        Ok(Self(Rc::new(RefCell::new(ForestInner {
            scan_buffer_pool: ScanBufferPool::new(scan_buffer_pool_capacity),
            pipeline,
            node_pool: NodePool::new(node_pool_capacity),
            manifest_log,
            grooves,
            compactions,
            tree_lookup,
            tree_registry,
            grid,
            options,
            progress: Progress::Idle,
            compactions_running: 0,
            pending_compact_callback: None,
        }))))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.0.borrow().progress
    }

    /// O(1) descriptor lookup by tree id. Returns the descriptor only —
    /// table/query access through a tree is out of scope here.
    #[must_use]
    pub fn tree_for_id(&self, tree_id: u16) -> Option<TreeInfo> {
        self.0.borrow().tree_registry.tree_for_id(tree_id).copied()
    }

    /// The read-only form of [`Forest::tree_for_id`].
    ///
    /// At this abstraction level a tree is represented purely by its
    /// [`TreeInfo`] descriptor (table storage internals are out of scope
    /// here), so the mutable and read-only dispatch paths spec.md §4.3
    /// describes collapse onto the same lookup; a real deployment's
    /// mutable/const tree references would diverge past this point.
    #[must_use]
    pub fn tree_for_id_const(&self, tree_id: u16) -> Option<TreeInfo> {
        self.tree_for_id(tree_id)
    }

    /// Replays the manifest log, dispatching every event to its owning
    /// tree, then runs both recovery cross-checks.
    ///
    /// # Panics
    ///
    /// Panics (fatal invariant violation) if `open` is called while another
    /// operation is in progress, if the manifest log replays a `tree_id` no
    /// groove owns, or if either post-replay verification fails.
    pub fn open(&self, callback: Box<dyn FnOnce()>) {
        log::trace!("forest open starting");
        let manifest_log = {
            let mut inner = self.0.borrow_mut();
            assert_eq!(
                inner.progress,
                Progress::Idle,
                "open called while another operation is in progress"
            );
            assert_eq!(
                inner.manifest_log.borrow().progress(),
                ManifestProgress::Idle,
                "open called with a manifest-log operation already in flight"
            );
            for groove in &mut inner.grooves {
                groove.open_commence();
            }
            inner.progress = Progress::Open;
            Rc::clone(&inner.manifest_log)
        };

        let forest_for_event = self.clone();
        let event_cb: Box<dyn FnMut(ManifestEvent)> = Box::new(move |event| {
            let mut inner = forest_for_event.0.borrow_mut();
            match event {
                ManifestEvent::Insert(table) => {
                    let tree_id = table.tree_id;
                    match inner.tree_handle_mut(tree_id) {
                        Some(handle) => handle.open_table(table),
                        None => panic!("manifest replay referenced unknown tree_id {tree_id}"),
                    }
                }
                ManifestEvent::Remove(table) => {
                    let tree_id = table.tree_id;
                    match inner.tree_handle_mut(tree_id) {
                        Some(handle) => handle.remove_table(&table),
                        None => panic!("manifest replay referenced unknown tree_id {tree_id}"),
                    }
                }
            }
        });

        let forest_for_done = self.clone();
        let done_cb: Box<dyn FnOnce()> = Box::new(move || {
            let manifest_log = Rc::clone(&forest_for_done.0.borrow().manifest_log);
            {
                let mut inner = forest_for_done.0.borrow_mut();
                crate::verify::verify_tables_recovered(&inner.grooves, &*manifest_log.borrow())
                    .expect("tables_recovered mismatch is a fatal invariant violation");
                for groove in &mut inner.grooves {
                    groove.open_complete();
                }
                crate::verify::verify_table_extents(&inner.grooves, &*manifest_log.borrow())
                    .expect("table_extents mismatch is a fatal invariant violation");
                inner.progress = Progress::Idle;
            }
            log::debug!("forest open complete, both recovery verifications passed");
            callback();
        });

        manifest_log.borrow_mut().open(event_cb, done_cb);
    }

    /// Runs one beat of compaction for operation `op`.
    ///
    /// # Panics
    ///
    /// Panics if called while another operation is in progress, or if the
    /// bar's first beat finds compactions already queued.
    pub fn compact(&self, op: u64, callback: Box<dyn FnOnce()>) {
        log::trace!("forest compact(op={op}) starting");
        let (beats_per_bar, growth_factor, first_beat, last_beat, manifest_compact_needed) = {
            let inner = self.0.borrow();
            assert_eq!(
                inner.progress,
                Progress::Idle,
                "compact called while another operation is in progress"
            );
            let beats_per_bar = inner.options.lsm_batch_multiple;
            let beat = op % u64::from(beats_per_bar);
            let first_beat = beat == 0;
            let last_beat = beat == u64::from(beats_per_bar) - 1;
            let manifest_compact_needed = last_beat && op > u64::from(beats_per_bar);
            (
                beats_per_bar,
                inner.options.lsm_growth_factor,
                first_beat,
                last_beat,
                manifest_compact_needed,
            )
        };

        if first_beat {
            let mut inner = self.0.borrow_mut();
            assert_eq!(
                inner.pipeline.borrow().compaction_count(),
                0,
                "first beat of a bar must start with no compactions queued"
            );
            // Bar 0 has nothing yet that could need compacting (no tables
            // have been flushed), so its first beat invokes no
            // `bar_setup` at all; `bar_finish` still runs at its last beat
            // to settle per-compaction state regardless.
            if op > 0 {
                let lsm_levels = inner.options.lsm_levels;
                let tree_id_min = inner.tree_registry.tree_id_min();
                let tree_id_max = inner.tree_registry.tree_id_max();
                for level_b in 0..lsm_levels {
                    for tree_id in tree_id_min..=tree_id_max {
                        let compaction = inner.compaction_at(tree_id, level_b);
                        let info = compaction.borrow_mut().bar_setup(op);
                        if let Some(info) = info {
                            let interface =
                                CompactionInterface::new(info.tree_id, info.level_b, compaction);
                            inner.pipeline.borrow_mut().queue_compaction(interface);
                        }
                    }
                }
                log::debug!(
                    "bar starting at op {op}: {} compactions queued across {lsm_levels} levels",
                    inner.pipeline.borrow().compaction_count()
                );
            } else {
                log::debug!("bar 0 starting: no bar_setup invoked");
            }
        }

        {
            let mut inner = self.0.borrow_mut();
            inner.progress = Progress::Compact { op };
            inner.compactions_running = if manifest_compact_needed { 2 } else { 1 };
            inner.pending_compact_callback = Some(callback);
        }

        let pipeline_handle = Rc::clone(&self.0.borrow().pipeline);
        let forest_for_pipeline = self.clone();
        pipeline::beat(
            &pipeline_handle,
            op,
            beats_per_bar,
            growth_factor,
            Box::new(move || compact_sub_op_done(&forest_for_pipeline, op, last_beat)),
        )
        .expect("block pool partition failed for the current compaction set");

        if manifest_compact_needed {
            log::trace!("op {op} is the bar's last beat past the first bar, starting manifest-log compaction in parallel");
            let manifest_log = Rc::clone(&self.0.borrow().manifest_log);
            let forest_for_manifest = self.clone();
            manifest_log.borrow_mut().compact(
                op,
                Box::new(move || compact_sub_op_done(&forest_for_manifest, op, last_beat)),
            );
        }
    }

    /// Runs a checkpoint.
    ///
    /// # Panics
    ///
    /// Panics if called while another operation is in progress, the
    /// manifest log is not idle, the grid is doing more than repair I/O,
    /// or either post-checkpoint verification fails.
    pub fn checkpoint(&self, callback: Box<dyn FnOnce()>) {
        log::trace!("forest checkpoint starting");
        let manifest_log = {
            let mut inner = self.0.borrow_mut();
            assert_eq!(
                inner.progress,
                Progress::Idle,
                "checkpoint called while another operation is in progress"
            );
            assert_eq!(
                inner.manifest_log.borrow().progress(),
                ManifestProgress::Idle,
                "checkpoint called with a manifest-log operation already in flight"
            );
            inner.grid.borrow().assert_only_repairing();
            for groove in &inner.grooves {
                groove.assert_between_bars();
            }
            inner.progress = Progress::Checkpoint;
            Rc::clone(&inner.manifest_log)
        };

        let forest = self.clone();
        manifest_log.borrow_mut().checkpoint(Box::new(move || {
            let manifest_log = Rc::clone(&forest.0.borrow().manifest_log);
            {
                let mut inner = forest.0.borrow_mut();
                crate::verify::verify_tables_recovered(&inner.grooves, &*manifest_log.borrow())
                    .expect("tables_recovered mismatch is a fatal invariant violation");
                crate::verify::verify_table_extents(&inner.grooves, &*manifest_log.borrow())
                    .expect("table_extents mismatch is a fatal invariant violation");
                inner.progress = Progress::Idle;
            }
            log::debug!("forest checkpoint complete, both recovery verifications passed");
            callback();
        }));
    }

    /// Re-initializes every sub-state except the grid, which the replica
    /// owns and resets itself. A full reset, as recorded in `DESIGN.md`.
    pub fn reset(&self) {
        log::warn!("forest reset: re-initializing all sub-state except the grid");
        let mut inner = self.0.borrow_mut();
        inner.progress = Progress::Idle;
        inner.compactions_running = 0;
        inner.pending_compact_callback = None;
        inner.pipeline.borrow_mut().reset();
    }
}

fn compact_sub_op_done(forest: &Forest, op: u64, last_beat: bool) {
    let remaining = {
        let mut inner = forest.0.borrow_mut();
        assert!(inner.compactions_running > 0, "compact sub-op completed without a matching start");
        inner.compactions_running -= 1;
        inner.compactions_running
    };
    if remaining > 0 {
        return;
    }

    let pipeline_handle = Rc::clone(&forest.0.borrow().pipeline);
    pipeline::beat_end(&pipeline_handle);

    if last_beat {
        let (lsm_levels, tree_id_min, tree_id_max) = {
            let inner = forest.0.borrow();
            (
                inner.options.lsm_levels,
                inner.tree_registry.tree_id_min(),
                inner.tree_registry.tree_id_max(),
            )
        };
        for level_b in 0..lsm_levels {
            for tree_id in tree_id_min..=tree_id_max {
                let compaction = forest.0.borrow().compaction_at(tree_id, level_b);
                compaction.borrow_mut().bar_finish(op);
            }
        }

        {
            let inner = forest.0.borrow();
            inner.pipeline.borrow().assert_bar_finished();
            inner.pipeline.borrow_mut().clear_compactions();
        }
    }

    {
        let mut inner = forest.0.borrow_mut();
        for groove in &mut inner.grooves {
            groove.compact(op);
        }
    }

    if last_beat {
        let beats_per_bar = forest.0.borrow().options.lsm_batch_multiple;
        let manifest_compact_needed = op > u64::from(beats_per_bar);
        if manifest_compact_needed {
            let manifest_log = Rc::clone(&forest.0.borrow().manifest_log);
            manifest_log.borrow_mut().compact_end();
            assert_eq!(
                manifest_log.borrow().progress(),
                ManifestProgress::Idle,
                "manifest log still compacting at last-beat completion"
            );
            log::trace!("op {op} finalized manifest-log compaction");
        }
    }

    let callback = {
        let mut inner = forest.0.borrow_mut();
        inner.progress = Progress::Idle;
        inner.pending_compact_callback.take()
    };
    log::debug!("forest compact(op={op}) complete");
    if let Some(callback) = callback {
        callback();
    }
}
