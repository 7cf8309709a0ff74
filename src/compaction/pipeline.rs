// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The compaction pipeline scheduler: fills three slots with the
//! read/merge/write stages of the compactions live in the current bar,
//! advancing every filled slot by one stage per round, and reconvenes after
//! every in-flight blip completes before making the next scheduling
//! decision (the "barrier").
//!
//! # Completion model
//!
//! Grid reads/writes and compaction blips complete via callback, and a
//! callback may fire synchronously (before the issuing call returns) or be
//! deferred to a later tick. A synchronous completion must not re-borrow
//! the [`Pipeline`] while the call that triggered it is still on the stack,
//! or `RefCell` panics. Every completion is instead funneled through a
//! small shared event queue — callbacks only ever push an event, never
//! call back into pipeline methods directly — and [`drive`] drains that
//! queue and decides the next actions with no pipeline borrow held across
//! any call into the `Grid` or a `Compaction`. This mirrors an io_uring-style
//! completion queue more than a direct callback chain, and is what lets
//! [`drive`] be invoked safely both synchronously (from inside the call
//! that produced a completion) and later, from a completion arriving off
//! the current call stack.

use crate::compaction::block_pool::{BlockPool, CompactionBlocks};
use crate::compaction::{BlipCallback, BlipOutcome, CompactionInterface};
use crate::config::PIPELINE_SLOT_COUNT;
use crate::bitset::Bitset;
use crate::error::Result;
use crate::grid::Grid;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Shared, reference-counted handle to a [`Pipeline`]. Completion closures
/// hold clones of this so they can resume scheduling once their blip or
/// tick has completed.
pub type PipelineHandle = Rc<RefCell<Pipeline>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOp {
    Read,
    Merge,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    compaction_index: usize,
    active_op: SlotOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Filling,
    Full,
}

enum PipelineEvent {
    Blip {
        slot_index: usize,
        outcome: BlipOutcome,
    },
    BeatFinishedNextTick,
}

enum Action {
    BlipRead {
        slot_index: usize,
        interface: CompactionInterface,
    },
    BlipMerge {
        slot_index: usize,
        interface: CompactionInterface,
    },
    BlipWrite {
        slot_index: usize,
        interface: CompactionInterface,
    },
    ScheduleNextTick,
}

/// The three-stage compaction scheduler.
pub struct Pipeline {
    grid: Rc<RefCell<dyn Grid>>,
    compactions: Vec<CompactionInterface>,
    block_pool: BlockPool,
    blocks_split: Vec<CompactionBlocks>,
    bar_active: Bitset,
    beat_active: Bitset,
    beat_acquired: Bitset,
    slots: [Option<Slot>; PIPELINE_SLOT_COUNT],
    slot_filled_count: usize,
    slot_running_count: usize,
    state: PipelineState,
    beat_exhausted: bool,
    finished: bool,
    tick_scheduled: bool,
    events: Rc<RefCell<VecDeque<PipelineEvent>>>,
    on_beat_done: Option<Box<dyn FnOnce()>>,
}

impl Pipeline {
    /// Creates an idle pipeline with bitsets sized for up to
    /// `max_compactions` simultaneously-live (tree, level) compactions —
    /// a fixed width of `(tree_id_max − tree_id_min) * lsm_levels`.
    #[must_use]
    pub fn new(grid: Rc<RefCell<dyn Grid>>, max_compactions: usize) -> PipelineHandle {
        Rc::new(RefCell::new(Self {
            grid,
            compactions: Vec::new(),
            block_pool: BlockPool::new(),
            blocks_split: Vec::new(),
            bar_active: Bitset::new(max_compactions),
            beat_active: Bitset::new(max_compactions),
            beat_acquired: Bitset::new(max_compactions),
            slots: [None; PIPELINE_SLOT_COUNT],
            slot_filled_count: 0,
            slot_running_count: 0,
            state: PipelineState::Filling,
            beat_exhausted: false,
            finished: false,
            tick_scheduled: false,
            events: Rc::new(RefCell::new(VecDeque::new())),
            on_beat_done: None,
        }))
    }

    /// Queues a (tree, level) compaction that declared work for the
    /// upcoming bar, during the bar's first beat.
    ///
    /// # Panics
    ///
    /// Panics if the fixed-width bitsets are already at capacity.
    pub fn queue_compaction(&mut self, interface: CompactionInterface) {
        assert!(
            self.compactions.len() < self.bar_active.len(),
            "more compactions queued than the fixed bitset width allows"
        );
        self.compactions.push(interface);
    }

    /// Number of compactions queued for the current bar.
    #[must_use]
    pub fn compaction_count(&self) -> usize {
        self.compactions.len()
    }

    /// Whether any bar is currently in progress (queued compactions exist).
    #[must_use]
    pub fn bar_active_count(&self) -> usize {
        self.bar_active.count()
    }

    /// Re-initializes the pipeline to its just-constructed state, as if no
    /// bar had ever run, while keeping the grid handle. A full reset, as
    /// recorded in `DESIGN.md`.
    pub fn reset(&mut self) {
        self.compactions.clear();
        self.blocks_split.clear();
        self.bar_active.clear_all();
        self.beat_active.clear_all();
        self.beat_acquired.clear_all();
        self.slots = [None; PIPELINE_SLOT_COUNT];
        self.slot_filled_count = 0;
        self.slot_running_count = 0;
        self.state = PipelineState::Filling;
        self.beat_exhausted = false;
        self.finished = false;
        self.tick_scheduled = false;
        self.events.borrow_mut().clear();
        self.on_beat_done = None;
    }

    /// Asserts `bar_active` is empty, as required before a bar's
    /// `bar_finish` pass runs on the bar's last beat.
    ///
    /// # Panics
    ///
    /// Panics if any compaction in the bar is still active.
    pub fn assert_bar_finished(&self) {
        assert_eq!(
            self.bar_active.count(),
            0,
            "bar_active must be empty once the bar's last beat completes"
        );
    }

    /// Every compaction queued for the current bar, in enumeration order.
    /// Used by `Forest` to run `bar_finish` over all of them.
    #[must_use]
    pub fn compactions(&self) -> &[CompactionInterface] {
        &self.compactions
    }

    /// Drops every queued compaction, readying the pipeline for the next
    /// bar's `bar_setup` pass on the bar's last beat.
    pub fn clear_compactions(&mut self) {
        self.compactions.clear();
    }

    fn apply_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Blip { slot_index, outcome } => {
                let slot = self.slots[slot_index]
                    .expect("blip completion arrived for an unoccupied slot");
                if let Some(beat_exhausted) = outcome.beat_exhausted {
                    debug_assert_eq!(
                        slot.active_op,
                        SlotOp::Merge,
                        "only the merge stage may report beat exhaustion"
                    );
                    self.beat_exhausted = beat_exhausted;
                }
                if let Some(true) = outcome.bar_exhausted {
                    assert_eq!(
                        outcome.beat_exhausted,
                        Some(true),
                        "bar_exhausted implies beat_exhausted"
                    );
                    log::debug!("compaction index {} exhausted its bar", slot.compaction_index);
                    self.bar_active.clear(slot.compaction_index);
                }
                assert!(self.slot_running_count > 0, "blip completion with no in-flight blips");
                self.slot_running_count -= 1;
            }
            PipelineEvent::BeatFinishedNextTick => {
                assert_eq!(self.beat_active.count(), 0);
                assert_eq!(self.slot_filled_count, 0);
                assert_eq!(self.slot_running_count, 0);
                assert!(self.slots.iter().all(Option::is_none));
                self.tick_scheduled = false;
                self.finished = true;
            }
        }
    }

    /// One scheduling round. Mutates slot state and bitsets but issues no
    /// external calls; callers perform the returned [`Action`]s after
    /// releasing their borrow.
    fn step(&mut self) -> Vec<Action> {
        debug_assert_eq!(self.slot_running_count, 0, "step re-entered with blips in flight");

        let Some(c_star) = self.beat_active.find_first_set() else {
            log::trace!("no compaction left active this beat, scheduling next tick");
            self.tick_scheduled = true;
            return vec![Action::ScheduleNextTick];
        };

        let mut actions = Vec::new();
        let mut cpu_to_start: Option<usize> = None;

        for slot_index in 0..PIPELINE_SLOT_COUNT {
            let Some(slot) = self.slots[slot_index] else {
                continue;
            };
            match slot.active_op {
                SlotOp::Read => {
                    if self.beat_exhausted {
                        self.slots[slot_index] = None;
                        self.slot_filled_count -= 1;
                    } else {
                        debug_assert!(cpu_to_start.is_none(), "two slots ready to start merge");
                        cpu_to_start = Some(slot_index);
                    }
                }
                SlotOp::Merge => {
                    self.slots[slot_index] = Some(Slot {
                        active_op: SlotOp::Write,
                        ..slot
                    });
                    self.slot_running_count += 1;
                    actions.push(Action::BlipWrite {
                        slot_index,
                        interface: self.compactions[slot.compaction_index].clone(),
                    });
                }
                SlotOp::Write => {
                    if self.beat_exhausted {
                        self.slots[slot_index] = None;
                        self.slot_filled_count -= 1;
                    } else {
                        self.slots[slot_index] = Some(Slot {
                            active_op: SlotOp::Read,
                            ..slot
                        });
                        self.slot_running_count += 1;
                        actions.push(Action::BlipRead {
                            slot_index,
                            interface: self.compactions[slot.compaction_index].clone(),
                        });
                    }
                }
            }
        }

        if self.state == PipelineState::Filling && !self.beat_exhausted {
            let slot_index = self.slot_filled_count;
            if slot_index < PIPELINE_SLOT_COUNT {
                let interface = self.compactions[c_star].clone();
                interface.beat_blocks_assign(self.blocks_split[c_star]);
                self.slots[slot_index] = Some(Slot {
                    compaction_index: c_star,
                    active_op: SlotOp::Read,
                });
                self.slot_filled_count += 1;
                self.slot_running_count += 1;
                actions.push(Action::BlipRead { slot_index, interface });
                if self.slot_filled_count >= PIPELINE_SLOT_COUNT {
                    self.state = PipelineState::Full;
                }
            }
        }

        if let Some(slot_index) = cpu_to_start {
            let compaction_index = self.slots[slot_index].unwrap().compaction_index;
            self.slots[slot_index] = Some(Slot {
                compaction_index,
                active_op: SlotOp::Merge,
            });
            self.slot_running_count += 1;
            actions.push(Action::BlipMerge {
                slot_index,
                interface: self.compactions[compaction_index].clone(),
            });
        }

        if actions.is_empty() {
            log::debug!("compaction index {c_star} drained its beat, advancing to the next one");
            self.beat_active.clear(c_star);
            self.beat_exhausted = false;
            self.slots = [None; PIPELINE_SLOT_COUNT];
            self.slot_filled_count = 0;
            self.state = PipelineState::Filling;
            return self.step();
        }

        actions
    }
}

fn issue(handle: &PipelineHandle, action: Action) {
    let events = Rc::clone(&handle.borrow().events);

    match action {
        Action::BlipRead { slot_index, interface } => {
            let events = Rc::clone(&events);
            let handle = Rc::clone(handle);
            let callback: BlipCallback = Box::new(move |outcome| {
                events
                    .borrow_mut()
                    .push_back(PipelineEvent::Blip { slot_index, outcome });
                drive(&handle);
            });
            interface.blip_read(callback);
        }
        Action::BlipMerge { slot_index, interface } => {
            let events = Rc::clone(&events);
            let handle = Rc::clone(handle);
            let callback: BlipCallback = Box::new(move |outcome| {
                events
                    .borrow_mut()
                    .push_back(PipelineEvent::Blip { slot_index, outcome });
                drive(&handle);
            });
            interface.blip_merge(callback);
        }
        Action::BlipWrite { slot_index, interface } => {
            let events = Rc::clone(&events);
            let handle = Rc::clone(handle);
            let callback: BlipCallback = Box::new(move |outcome| {
                events
                    .borrow_mut()
                    .push_back(PipelineEvent::Blip { slot_index, outcome });
                drive(&handle);
            });
            interface.blip_write(callback);
        }
        Action::ScheduleNextTick => {
            let grid = Rc::clone(&handle.borrow().grid);
            let handle = Rc::clone(handle);
            grid.borrow_mut().on_next_tick(Box::new(move || {
                events.borrow_mut().push_back(PipelineEvent::BeatFinishedNextTick);
                drive(&handle);
            }));
        }
    }
}

/// Drains pending completions and advances the pipeline as far as it can go
/// without waiting on a not-yet-arrived completion. Safe to call both
/// synchronously (nested inside the call that produced a completion) and
/// later from an independent call stack (an asynchronous completion): no
/// [`Pipeline`] borrow is ever held while calling into the `Grid` or a
/// `Compaction`, so a synchronous completion's nested call lands on a free
/// `RefCell` rather than panicking.
pub fn drive(handle: &PipelineHandle) {
    loop {
        loop {
            let event = handle.borrow().events.borrow_mut().pop_front();
            match event {
                Some(event) => handle.borrow_mut().apply_event(event),
                None => break,
            }
        }

        let (actions, done) = {
            let mut pipeline = handle.borrow_mut();
            if pipeline.finished {
                (Vec::new(), true)
            } else if pipeline.slot_running_count > 0 || pipeline.tick_scheduled {
                (Vec::new(), false)
            } else {
                (pipeline.step(), false)
            }
        };

        if done {
            let callback = handle.borrow_mut().on_beat_done.take();
            if let Some(callback) = callback {
                callback();
            }
            return;
        }

        if actions.is_empty() {
            return;
        }

        for action in actions {
            issue(handle, action);
        }
    }
}

/// Begins one beat. `op` is the replica's monotonically increasing
/// operation number; `beats_per_bar`/`growth_factor` come from
/// [`crate::config::ForestOptions`].
///
/// # Errors
///
/// Returns an error if the block pool cannot be partitioned across the
/// queued compactions.
///
/// # Panics
///
/// Panics if a beat is started while slots are non-empty or a previous
/// beat's callback has not yet fired — both fatal invariant violations.
pub fn beat(
    handle: &PipelineHandle,
    op: u64,
    beats_per_bar: u32,
    growth_factor: u32,
    on_done: Box<dyn FnOnce()>,
) -> Result<()> {
    {
        let mut pipeline = handle.borrow_mut();
        pipeline.slot_filled_count = 0;
        pipeline.slot_running_count = 0;
        pipeline.finished = false;
        pipeline.tick_scheduled = false;

        let first_beat = op % u64::from(beats_per_bar) == 0;
        log::trace!(
            "beat {op} starting, first_beat={first_beat}, {} compactions queued for this bar",
            pipeline.compactions.len()
        );
        if first_beat {
            pipeline.bar_active.clear_all();
            for i in 0..pipeline.compactions.len() {
                pipeline.bar_active.set(i);
            }

            if pipeline.compactions.is_empty() {
                pipeline.blocks_split.clear();
            } else {
                pipeline.blocks_split = pipeline
                    .block_pool
                    .divide_blocks(pipeline.compactions.len(), growth_factor)?;
                log::debug!(
                    "bar starting at op {op}: partitioned block pool across {} compactions",
                    pipeline.compactions.len()
                );
                for i in 0..pipeline.compactions.len() {
                    let scratch = pipeline.blocks_split[i].scratch;
                    pipeline.compactions[i].bar_setup_budget(beats_per_bar, scratch);
                }
            }
        }

        pipeline.beat_active.copy_from(&pipeline.bar_active);
        assert!(
            pipeline.slots.iter().all(Option::is_none),
            "pipeline slots must be empty at beat start"
        );
        assert!(
            pipeline.on_beat_done.is_none(),
            "a previous beat's callback has not yet fired"
        );

        let to_acquire: Vec<usize> = pipeline.beat_active.iter_set().collect();
        for i in to_acquire {
            pipeline.beat_acquired.set(i);
            pipeline.compactions[i].beat_grid_acquire();
        }

        pipeline.on_beat_done = Some(on_done);
        pipeline.state = PipelineState::Filling;
    }

    drive(handle);
    Ok(())
}

/// Ends a beat: forfeits every grid acquisition made at its start, in
/// reverse compaction-index order. Called synchronously by the forest,
/// not from within the pipeline itself.
pub fn beat_end(handle: &PipelineHandle) {
    let mut pipeline = handle.borrow_mut();
    let forfeited = pipeline.beat_acquired.count();
    for i in (0..pipeline.compactions.len()).rev() {
        if pipeline.beat_acquired.get(i) {
            pipeline.compactions[i].beat_grid_forfeit();
            pipeline.beat_acquired.clear(i);
        }
    }
    log::trace!("beat_end forfeited {forfeited} grid acquisitions");
}
