// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end scenarios for the compaction pipeline and forest coordinator.

use forest::compaction::block_pool::{BlockRange, CompactionBlocks};
use forest::compaction::pipeline::{self, Pipeline};
use forest::compaction::{BlipCallback, BlipOutcome, Compaction, CompactionInfo, CompactionInterface};
use forest::config::ForestOptions;
use forest::grid::{Grid, GridCallback, NextTickCallback, ReadRequest, WriteRequest};
use forest::manifest_log::{ManifestEvent, ManifestLog, ManifestProgress, ManifestTableRef};
use forest::tree_info::{TreeInfo, TreeKind};
use forest::{Forest, GrooveSpec};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// A `Grid` whose reads/writes complete synchronously and whose
/// `on_next_tick` callbacks are queued for the test to drive explicitly,
/// matching the replica's real tick discipline.
struct TestGrid {
    ticks: VecDeque<NextTickCallback>,
}

impl TestGrid {
    fn new() -> Self {
        Self {
            ticks: VecDeque::new(),
        }
    }

    fn run_pending_ticks(&mut self) {
        while let Some(cb) = self.ticks.pop_front() {
            cb();
        }
    }
}

impl Grid for TestGrid {
    fn read(&mut self, _request: ReadRequest, callback: GridCallback) {
        callback();
    }

    fn write(&mut self, _request: WriteRequest, callback: GridCallback) {
        callback();
    }

    fn on_next_tick(&mut self, callback: NextTickCallback) {
        self.ticks.push_back(callback);
    }

    fn assert_only_repairing(&self) {}
}

/// A compaction whose merge stage reports `beat_exhausted`/`bar_exhausted`
/// after a scripted number of rounds, and that tracks acquire/forfeit and
/// blip call counts for assertions.
struct ScriptedCompaction {
    merge_rounds_remaining: Cell<u32>,
    acquired: Cell<bool>,
    read_calls: Cell<u32>,
    merge_calls: Cell<u32>,
    write_calls: Cell<u32>,
    bar_setup_calls: Cell<u32>,
    bar_finish_calls: Cell<u32>,
    has_work: bool,
}

impl ScriptedCompaction {
    fn new(merge_rounds: u32) -> Self {
        Self {
            merge_rounds_remaining: Cell::new(merge_rounds),
            acquired: Cell::new(false),
            read_calls: Cell::new(0),
            merge_calls: Cell::new(0),
            write_calls: Cell::new(0),
            bar_setup_calls: Cell::new(0),
            bar_finish_calls: Cell::new(0),
            has_work: true,
        }
    }

    fn with_no_work() -> Self {
        let mut this = Self::new(0);
        this.has_work = false;
        this
    }
}

impl Compaction for ScriptedCompaction {
    fn bar_setup(&mut self, _op: u64) -> Option<CompactionInfo> {
        self.bar_setup_calls.set(self.bar_setup_calls.get() + 1);
        if self.has_work {
            Some(CompactionInfo {
                tree_id: 1,
                level_b: 0,
            })
        } else {
            None
        }
    }

    fn bar_setup_budget(&mut self, _beats_per_bar: u32, _scratch_blocks: [BlockRange; 2]) {}

    fn bar_finish(&mut self, _op: u64) {
        self.bar_finish_calls.set(self.bar_finish_calls.get() + 1);
    }

    fn beat_grid_acquire(&mut self) {
        assert!(!self.acquired.get(), "acquire without matching forfeit");
        self.acquired.set(true);
    }

    fn beat_grid_forfeit(&mut self) {
        assert!(self.acquired.get(), "forfeit without matching acquire");
        self.acquired.set(false);
    }

    fn beat_blocks_assign(&mut self, _blocks: CompactionBlocks) {}

    fn blip_read(&mut self, callback: BlipCallback) {
        self.read_calls.set(self.read_calls.get() + 1);
        callback(BlipOutcome::default());
    }

    fn blip_merge(&mut self, callback: BlipCallback) {
        self.merge_calls.set(self.merge_calls.get() + 1);
        let remaining = self.merge_rounds_remaining.get();
        let next = remaining.saturating_sub(1);
        self.merge_rounds_remaining.set(next);
        let exhausted = next == 0;
        callback(BlipOutcome {
            beat_exhausted: Some(exhausted),
            bar_exhausted: Some(exhausted),
        });
    }

    fn blip_write(&mut self, callback: BlipCallback) {
        self.write_calls.set(self.write_calls.get() + 1);
        callback(BlipOutcome::default());
    }
}

/// A compaction that paces its merge stage across beats: it exhausts its
/// *beat* every `merges_per_beat` merge calls, and exhausts its *bar* once
/// it has exhausted `beats_to_exhaust_bar` beats that way. Unlike
/// `ScriptedCompaction`, whose single round counter conflates beat and bar
/// exhaustion, this lets a test drive several separate `beat()` calls and
/// observe a compaction stay beat-exhausted-but-not-bar-exhausted across
/// more than one of them.
struct MultiBeatCompaction {
    merges_per_beat: u32,
    beats_to_exhaust_bar: u32,
    beat_merge_count: Cell<u32>,
    beats_completed: Cell<u32>,
    merge_calls: Cell<u32>,
    bar_finish_calls: Cell<u32>,
}

impl MultiBeatCompaction {
    fn new(merges_per_beat: u32, beats_to_exhaust_bar: u32) -> Self {
        Self {
            merges_per_beat,
            beats_to_exhaust_bar,
            beat_merge_count: Cell::new(0),
            beats_completed: Cell::new(0),
            merge_calls: Cell::new(0),
            bar_finish_calls: Cell::new(0),
        }
    }
}

impl Compaction for MultiBeatCompaction {
    fn bar_setup(&mut self, _op: u64) -> Option<CompactionInfo> {
        Some(CompactionInfo {
            tree_id: 1,
            level_b: 0,
        })
    }

    fn bar_setup_budget(&mut self, _beats_per_bar: u32, _scratch_blocks: [BlockRange; 2]) {}

    fn bar_finish(&mut self, _op: u64) {
        self.bar_finish_calls.set(self.bar_finish_calls.get() + 1);
    }

    fn beat_grid_acquire(&mut self) {}
    fn beat_grid_forfeit(&mut self) {}
    fn beat_blocks_assign(&mut self, _blocks: CompactionBlocks) {}

    fn blip_read(&mut self, callback: BlipCallback) {
        callback(BlipOutcome::default());
    }

    fn blip_merge(&mut self, callback: BlipCallback) {
        self.merge_calls.set(self.merge_calls.get() + 1);
        let count = self.beat_merge_count.get() + 1;
        if count >= self.merges_per_beat {
            self.beat_merge_count.set(0);
            let beats_done = self.beats_completed.get() + 1;
            self.beats_completed.set(beats_done);
            let bar_done = beats_done >= self.beats_to_exhaust_bar;
            callback(BlipOutcome {
                beat_exhausted: Some(true),
                bar_exhausted: Some(bar_done),
            });
        } else {
            self.beat_merge_count.set(count);
            callback(BlipOutcome {
                beat_exhausted: Some(false),
                bar_exhausted: Some(false),
            });
        }
    }

    fn blip_write(&mut self, callback: BlipCallback) {
        callback(BlipOutcome::default());
    }
}

fn run_beat(
    handle: &pipeline::PipelineHandle,
    grid: &Rc<RefCell<TestGrid>>,
    op: u64,
    beats_per_bar: u32,
    growth_factor: u32,
) {
    let done = Rc::new(Cell::new(false));
    let done_flag = Rc::clone(&done);
    pipeline::beat(
        handle,
        op,
        beats_per_bar,
        growth_factor,
        Box::new(move || done_flag.set(true)),
    )
    .expect("beat should partition the block pool successfully");
    grid.borrow_mut().run_pending_ticks();
    assert!(done.get(), "beat callback never fired");
}

/// Seed scenario 1: `lsm_batch_multiple = 4`, single tree, three compactions
/// live. Beat 0 queues all three; each completes one read/merge/write round;
/// beat 0's callback fires exactly once.
#[test]
fn three_compactions_complete_in_one_beat() {
    let grid = Rc::new(RefCell::new(TestGrid::new()));
    let handle = Pipeline::new(grid.clone(), 8);

    let compactions: Vec<Rc<RefCell<ScriptedCompaction>>> = (0..3)
        .map(|_| Rc::new(RefCell::new(ScriptedCompaction::new(1))))
        .collect();
    for c in &compactions {
        let dyn_c: Rc<RefCell<dyn Compaction>> = Rc::clone(c);
        handle
            .borrow_mut()
            .queue_compaction(CompactionInterface::new(1, 0, dyn_c));
    }

    run_beat(&handle, &grid, 0, 4, 8);

    let pipeline = handle.borrow();
    assert_eq!(pipeline.bar_active_count(), 0, "all three compactions must finish within the beat");
    for c in &compactions {
        assert_eq!(c.borrow().read_calls.get(), 1);
        assert_eq!(c.borrow().merge_calls.get(), 1);
        assert_eq!(c.borrow().write_calls.get(), 1);
    }
}

/// Seed scenario 2: two trees, the first compaction's merge reports
/// `beat_exhausted = true` well before the second compaction's merge does.
/// The second compaction does not start until the first has fully drained,
/// and both end the beat with their `bar_active` bit cleared.
#[test]
fn a_quickly_exhausted_compaction_does_not_block_the_next_one() {
    let grid = Rc::new(RefCell::new(TestGrid::new()));
    let handle = Pipeline::new(grid.clone(), 8);

    let short = Rc::new(RefCell::new(ScriptedCompaction::new(1)));
    let long = Rc::new(RefCell::new(ScriptedCompaction::new(3)));
    let short_dyn: Rc<RefCell<dyn Compaction>> = Rc::clone(&short);
    let long_dyn: Rc<RefCell<dyn Compaction>> = Rc::clone(&long);
    for c in [short_dyn, long_dyn] {
        handle.borrow_mut().queue_compaction(CompactionInterface::new(1, 0, c));
    }

    run_beat(&handle, &grid, 0, 4, 8);

    assert_eq!(handle.borrow().bar_active_count(), 0);
    assert_eq!(short.borrow().merge_calls.get(), 1, "the short compaction exhausts after one merge");
    assert_eq!(long.borrow().merge_calls.get(), 3, "the long compaction takes three merges to exhaust");
    assert_eq!(short.borrow().write_calls.get(), 1);
    assert_eq!(long.borrow().write_calls.get(), 3);
}

/// Seed scenario 3: a bar of five compactions where one reports
/// `bar_exhausted = true` on its very first beat. The remaining beats of the
/// bar see `bar_active.count() == 4`; `bar_finish` still runs over all five
/// at the end of the bar.
#[test]
fn bar_exhausted_compaction_is_skipped_for_the_rest_of_the_bar() {
    let grid = Rc::new(RefCell::new(TestGrid::new()));
    let handle = Pipeline::new(grid.clone(), 8);

    // The first compaction exhausts its bar after a single beat; the other
    // four need all four beats of the bar, so they remain live
    // (beat-exhausted, not bar-exhausted) until the bar's last beat.
    let compactions: Vec<Rc<RefCell<MultiBeatCompaction>>> = std::iter::once(1)
        .chain(std::iter::repeat(4).take(4))
        .map(|beats| Rc::new(RefCell::new(MultiBeatCompaction::new(1, beats))))
        .collect();
    for c in &compactions {
        let dyn_c: Rc<RefCell<dyn Compaction>> = Rc::clone(c);
        handle
            .borrow_mut()
            .queue_compaction(CompactionInterface::new(1, 0, dyn_c));
    }

    run_beat(&handle, &grid, 0, 4, 8);
    assert_eq!(
        handle.borrow().bar_active_count(),
        4,
        "only the single-round compaction should have cleared bar_active"
    );

    run_beat(&handle, &grid, 1, 4, 8);
    assert_eq!(
        handle.borrow().bar_active_count(),
        4,
        "the exhausted compaction must not be touched again this bar"
    );
    assert_eq!(
        compactions[0].borrow().merge_calls.get(),
        1,
        "the bar-exhausted compaction must not run again within the same bar"
    );

    run_beat(&handle, &grid, 2, 4, 8);
    run_beat(&handle, &grid, 3, 4, 8);
    assert_eq!(
        handle.borrow().bar_active_count(),
        0,
        "the remaining four compactions must exhaust their bar on its last beat"
    );

    for c in &compactions {
        c.borrow_mut().bar_finish(3);
    }
    for c in &compactions {
        assert_eq!(c.borrow().bar_finish_calls.get(), 1);
    }
}

/// Builds a one-groove, one-tree forest whose compactions are looked up
/// from a caller-supplied map keyed by `(tree_id, level_b)`, defaulting to
/// "no work" compactions for anything unlisted.
fn build_forest_with(
    grid: Rc<RefCell<TestGrid>>,
    manifest_log: Rc<RefCell<dyn ManifestLog>>,
    lsm_batch_multiple: u32,
) -> Forest {
    let grid_trait: Rc<RefCell<dyn Grid>> = grid;
    let tree = TreeInfo {
        tree_id: 1,
        tree_name: "accounts.objects",
        groove_name: "accounts",
        kind: TreeKind::Objects,
    };
    Forest::new(
        grid_trait,
        manifest_log,
        ForestOptions::default().lsm_batch_multiple(lsm_batch_multiple),
        64,
        64,
        vec![GrooveSpec {
            name: "accounts",
            trees: vec![tree],
        }],
        |_info, _level_b| -> Rc<RefCell<dyn Compaction>> {
            Rc::new(RefCell::new(ScriptedCompaction::with_no_work()))
        },
    )
    .expect("forest construction should succeed")
}

/// A `ManifestLog` double that completes every operation synchronously and
/// tracks whether a compaction is currently in flight, so the forest's
/// `last_beat` barrier can be exercised.
struct ScriptedManifestLog {
    progress: Cell<ManifestProgress>,
    compact_calls: Cell<u32>,
    checkpoint_calls: Cell<u32>,
    tables: Vec<ManifestTableRef>,
}

impl ScriptedManifestLog {
    fn new() -> Self {
        Self {
            progress: Cell::new(ManifestProgress::Idle),
            compact_calls: Cell::new(0),
            checkpoint_calls: Cell::new(0),
            tables: Vec::new(),
        }
    }
}

impl ManifestLog for ScriptedManifestLog {
    fn open(&mut self, _on_event: Box<dyn FnMut(ManifestEvent)>, on_done: Box<dyn FnOnce()>) {
        on_done();
    }

    fn compact(&mut self, _op: u64, on_done: Box<dyn FnOnce()>) {
        self.compact_calls.set(self.compact_calls.get() + 1);
        self.progress.set(ManifestProgress::Compacting);
        // Completes synchronously; the forest observes `Idle` again by the
        // time it checks after both sub-operations finish.
        self.progress.set(ManifestProgress::Idle);
        on_done();
    }

    fn compact_end(&mut self) {
        assert_eq!(self.progress.get(), ManifestProgress::Idle);
    }

    fn checkpoint(&mut self, on_done: Box<dyn FnOnce()>) {
        self.checkpoint_calls.set(self.checkpoint_calls.get() + 1);
        on_done();
    }

    fn progress(&self) -> ManifestProgress {
        self.progress.get()
    }

    fn table_extents_count(&self) -> usize {
        self.tables.len()
    }

    fn tables_latest(&self) -> Vec<ManifestTableRef> {
        self.tables.clone()
    }
}

/// Seed scenario 4: on the last beat of a bar beyond the first
/// (`op > lsm_batch_multiple`), the manifest-log compaction runs alongside
/// the pipeline beat; the user callback only fires once both have
/// completed.
#[test]
fn last_beat_past_the_first_bar_runs_manifest_compaction_concurrently() {
    let grid = Rc::new(RefCell::new(TestGrid::new()));
    let manifest_log = Rc::new(RefCell::new(ScriptedManifestLog::new()));
    let manifest_trait: Rc<RefCell<dyn ManifestLog>> = Rc::clone(&manifest_log);
    let forest = build_forest_with(Rc::clone(&grid), manifest_trait, 4);

    // Drive bar 0 (op 0..=3) to completion first: the first bar never runs
    // manifest-log compaction.
    for op in 0..4 {
        let done = Rc::new(Cell::new(false));
        let done_flag = Rc::clone(&done);
        forest.compact(op, Box::new(move || done_flag.set(true)));
        grid.borrow_mut().run_pending_ticks();
        assert!(done.get());
    }
    assert_eq!(manifest_log.borrow().compact_calls.get(), 0, "bar 0 must never compact the manifest log");

    // Bar 1's last beat (op = 7) has op > lsm_batch_multiple (4): this is
    // where manifest-log compaction should run.
    for op in 4..7 {
        let done = Rc::new(Cell::new(false));
        let done_flag = Rc::clone(&done);
        forest.compact(op, Box::new(move || done_flag.set(true)));
        grid.borrow_mut().run_pending_ticks();
        assert!(done.get());
    }

    let done = Rc::new(Cell::new(false));
    let done_flag = Rc::clone(&done);
    forest.compact(7, Box::new(move || done_flag.set(true)));
    grid.borrow_mut().run_pending_ticks();
    assert!(done.get(), "compact callback should fire once both sub-operations complete");
    assert_eq!(manifest_log.borrow().compact_calls.get(), 1);
}

/// Seed scenario 5: an empty compact (`op = 1`, no compactions queued)
/// fires its callback exactly once, via `Grid::on_next_tick`.
#[test]
fn empty_compact_fires_callback_once_via_next_tick() {
    let grid = Rc::new(RefCell::new(TestGrid::new()));
    let manifest_log: Rc<RefCell<dyn ManifestLog>> = Rc::new(RefCell::new(ScriptedManifestLog::new()));
    let forest = build_forest_with(Rc::clone(&grid), manifest_log, 4);

    let call_count = Rc::new(Cell::new(0));
    let call_count_flag = Rc::clone(&call_count);
    forest.compact(1, Box::new(move || call_count_flag.set(call_count_flag.get() + 1)));
    grid.borrow_mut().run_pending_ticks();

    assert_eq!(call_count.get(), 1, "the compact callback must fire exactly once");
}

/// Seed scenario 6: a manifest replay that inserts then removes the same
/// table leaves the owning tree with no live tables, and both post-replay
/// verifications pass.
#[test]
fn manifest_remove_event_leaves_no_live_table_behind() {
    struct ReplayManifestLog {
        table: ManifestTableRef,
    }

    impl ManifestLog for ReplayManifestLog {
        fn open(&mut self, mut on_event: Box<dyn FnMut(ManifestEvent)>, on_done: Box<dyn FnOnce()>) {
            on_event(ManifestEvent::Insert(self.table.clone()));
            on_event(ManifestEvent::Remove(self.table.clone()));
            on_done();
        }

        fn compact(&mut self, _op: u64, on_done: Box<dyn FnOnce()>) {
            on_done();
        }

        fn compact_end(&mut self) {}

        fn checkpoint(&mut self, on_done: Box<dyn FnOnce()>) {
            on_done();
        }

        fn progress(&self) -> ManifestProgress {
            ManifestProgress::Idle
        }

        fn table_extents_count(&self) -> usize {
            // The table was inserted then removed: the manifest log itself
            // tracks zero live extents for it.
            0
        }

        fn tables_latest(&self) -> Vec<ManifestTableRef> {
            // Reverse replay never re-surfaces a removed table.
            Vec::new()
        }
    }

    let table = ManifestTableRef {
        tree_id: 1,
        key_min: vec![0],
        key_max: vec![255],
        checksum: 42,
        address: 9,
        snapshot_min: 0,
        snapshot_max: u64::MAX,
        level: 0,
    };

    let grid = Rc::new(RefCell::new(TestGrid::new()));
    let manifest_log: Rc<RefCell<dyn ManifestLog>> =
        Rc::new(RefCell::new(ReplayManifestLog { table }));
    let forest = build_forest_with(grid, manifest_log, 4);

    let done = Rc::new(Cell::new(false));
    let done_flag = Rc::clone(&done);
    forest.open(Box::new(move || done_flag.set(true)));

    assert!(done.get(), "open should complete without tripping a verification panic");
}
