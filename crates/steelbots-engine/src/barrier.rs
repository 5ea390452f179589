//! Per-turn rendezvous between the scheduler and every robot controller.
//!
//! The barrier cycles `Opened -> Collecting -> Closed` once per turn. The
//! scheduler opens a turn, robot threads resume from their suspension points
//! and post commits, and the scheduler collects until every live robot has
//! either committed or run out of CPU budget. A commit that arrives after
//! its window stays in the slot and is picked up when the next turn closes.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use steelbots_core::{ResourceGovernor, TurnCommands};

use crate::RobotError;

/// Where the barrier is in its per-turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    Opened,
    Collecting,
    Closed,
}

#[derive(Debug, Default)]
struct Slot {
    commands: Option<TurnCommands>,
    committed_at: Option<Instant>,
    cut: bool,
    killed: bool,
}

#[derive(Debug)]
struct BarrierState {
    turn: u64,
    phase: BarrierPhase,
    opened_at: Instant,
    shutdown: bool,
    slots: Vec<Slot>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BarrierState>,
    turn_opened: Condvar,
    commit_posted: Condvar,
}

/// Aggregate command set released when the barrier closes.
#[derive(Debug)]
pub struct BarrierOutcome {
    /// One slot per robot; `None` for robots that missed the window.
    pub commands: Vec<Option<TurnCommands>>,
    /// Robots cut off by the CPU quota this turn.
    pub cut: Vec<usize>,
}

/// Cloneable handle onto the shared barrier.
#[derive(Debug, Clone)]
pub struct ExecutionBarrier {
    shared: Arc<Shared>,
}

impl ExecutionBarrier {
    #[must_use]
    pub fn new(robot_count: usize) -> Self {
        let mut slots = Vec::with_capacity(robot_count);
        slots.resize_with(robot_count, Slot::default);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BarrierState {
                    turn: 0,
                    phase: BarrierPhase::Closed,
                    opened_at: Instant::now(),
                    shutdown: false,
                    slots,
                }),
                turn_opened: Condvar::new(),
                commit_posted: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Where the barrier currently is in its per-turn cycle.
    #[must_use]
    pub fn phase(&self) -> BarrierPhase {
        self.lock().phase
    }

    /// Scheduler side: release every controller into the given turn.
    pub fn open(&self, turn: u64) {
        let mut state = self.lock();
        state.turn = turn;
        state.phase = BarrierPhase::Opened;
        state.opened_at = Instant::now();
        let opened_at = state.opened_at;
        for slot in &mut state.slots {
            // A late commit from the previous turn stays queued; only the
            // per-turn bookkeeping resets.
            slot.committed_at = slot.commands.as_ref().map(|_| opened_at);
            slot.cut = false;
        }
        drop(state);
        self.shared.turn_opened.notify_all();
    }

    /// Scheduler side: wait until every live robot has committed or been
    /// quota-cut, then release the aggregate command set. Observed wall time
    /// is charged against each robot's CPU ledger.
    pub fn collect(&self, governor: &Mutex<ResourceGovernor>) -> BarrierOutcome {
        let quota = {
            governor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cpu_quota()
        };
        let mut state = self.lock();
        state.phase = BarrierPhase::Collecting;
        let deadline = state.opened_at + quota;
        loop {
            let pending = state
                .slots
                .iter()
                .any(|slot| !slot.killed && !slot.cut && slot.commands.is_none());
            if !pending || state.shutdown {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                for slot in &mut state.slots {
                    if !slot.killed && slot.commands.is_none() {
                        slot.cut = true;
                    }
                }
                break;
            }
            let (next, _timeout) = self
                .shared
                .commit_posted
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        state.phase = BarrierPhase::Closed;

        let opened_at = state.opened_at;
        let mut commands = Vec::with_capacity(state.slots.len());
        let mut cut = Vec::new();
        let mut ledger = governor.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, slot) in state.slots.iter_mut().enumerate() {
            if !slot.killed {
                ledger.begin_turn(index);
                if let Some(committed_at) = slot.committed_at.take() {
                    ledger.charge_time(index, committed_at.saturating_duration_since(opened_at));
                } else if slot.cut {
                    ledger.charge_time(index, quota);
                    cut.push(index);
                }
            }
            commands.push(slot.commands.take());
        }
        BarrierOutcome { commands, cut }
    }

    /// Scheduler side: permanently retire a robot. Its controller thread is
    /// woken and unwinds with [`RobotError::Killed`].
    pub fn mark_killed(&self, robot: usize) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(robot) {
            slot.killed = true;
            slot.commands = None;
        }
        drop(state);
        self.shared.turn_opened.notify_all();
        self.shared.commit_posted.notify_all();
    }

    /// Scheduler side: end the round, unwinding every controller thread.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        drop(state);
        self.shared.turn_opened.notify_all();
        self.shared.commit_posted.notify_all();
    }

    /// Controller side: block until a turn newer than `last_seen` opens.
    pub fn await_turn(&self, robot: usize, last_seen: u64) -> Result<u64, RobotError> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return Err(RobotError::RoundOver);
            }
            if state.slots.get(robot).is_none_or(|slot| slot.killed) {
                return Err(RobotError::Killed);
            }
            if state.turn > last_seen {
                return Ok(state.turn);
            }
            state = self
                .shared
                .turn_opened
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Controller side: post this robot's command bundle for the open turn.
    pub fn commit(&self, robot: usize, commands: TurnCommands) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(robot)
            && !slot.killed
        {
            slot.commands = Some(commands);
            slot.committed_at = Some(Instant::now());
        }
        drop(state);
        self.shared.commit_posted.notify_all();
    }
}
