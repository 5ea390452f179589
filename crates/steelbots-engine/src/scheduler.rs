//! The turn scheduler: drives rounds and turns, applies committed commands,
//! and publishes snapshots to observers.
//!
//! One scheduler thread owns the [`BattleState`] outright. Per turn it
//! evaluates conditions and surfaces faults, opens the execution barrier,
//! collects commits under the CPU quota, resolves the turn, fans events out
//! to the controllers' queues, and publishes an immutable snapshot. External
//! control arrives over the command bus and takes effect at turn boundaries.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use steelbots_core::{
    BattleConfig, BattleObserver, BattleResult, BattleState, ControlCommand, EventKind,
    ResourceGovernor, Turn,
};
use tracing::{debug, info, warn};

use crate::barrier::ExecutionBarrier;
use crate::command::{CommandReceiver, CommandSender, create_command_bus, drain_pending_commands};
use crate::controller::{BattleWiring, Fault, spawn_controller};
use crate::{BattleError, ControlError, RobotSpec};

/// Running battle handle. All control methods are safe to call from any
/// thread while the battle runs; they enqueue commands that the scheduler
/// applies at the next turn boundary.
pub struct BattleHandle {
    commands: CommandSender,
    thread: Option<JoinHandle<BattleResult>>,
}

impl BattleHandle {
    /// Clone of the command sender, for observers or remote surfaces.
    #[must_use]
    pub fn controls(&self) -> CommandSender {
        self.commands.clone()
    }

    fn enqueue(&self, command: ControlCommand) -> Result<(), ControlError> {
        use crossfire::TrySendError;
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ControlError::CommandQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ControlError::CommandQueueClosed),
        }
    }

    pub fn pause(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Resume)
    }

    /// Execute exactly one turn while paused.
    pub fn single_step(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::SingleStep)
    }

    pub fn stop(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Stop)
    }

    pub fn kill(&self, robot: usize) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Kill { robot })
    }

    pub fn restart(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Restart)
    }

    /// Restart with the seed the battle actually ran with, reproducing it.
    pub fn replay(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Replay)
    }

    /// Block until the battle finishes and return the final standings.
    pub fn wait(mut self) -> Result<BattleResult, BattleError> {
        let thread = self
            .thread
            .take()
            .ok_or(BattleError::SchedulerPanicked)?;
        thread.join().map_err(|_| BattleError::SchedulerPanicked)
    }
}

/// Validate configuration and roster, then start the battle on its own
/// scheduler thread. Configuration failures surface here; nothing is
/// spawned for an unstartable battle.
pub fn start_battle(
    config: BattleConfig,
    roster: Vec<RobotSpec>,
    observers: Vec<Box<dyn BattleObserver>>,
) -> Result<BattleHandle, BattleError> {
    let names: Vec<String> = roster.iter().map(|spec| spec.name.clone()).collect();
    let state = BattleState::new(config, names)?;
    let (commands, receiver) = create_command_bus(64);
    let thread = std::thread::Builder::new()
        .name("turn-scheduler".to_owned())
        .spawn(move || Scheduler::new(state, roster, observers, receiver).run())?;
    Ok(BattleHandle {
        commands,
        thread: Some(thread),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerPhase {
    Idle,
    RoundStarting,
    TurnRunning,
    Paused,
    RoundEnded,
    BattleFinished,
}

#[derive(Debug, Clone, Copy)]
enum RestartMode {
    Fresh,
    Replay,
}

enum RoundExit {
    Completed,
    Stopped,
    Restart(RestartMode),
}

struct Scheduler {
    state: BattleState,
    roster: Vec<RobotSpec>,
    observers: Vec<Box<dyn BattleObserver>>,
    commands: CommandReceiver,
    governor: Arc<Mutex<ResourceGovernor>>,
    phase: SchedulerPhase,
    pause_depth: u32,
    paused_notified: bool,
    steps_pending: u32,
    stop_requested: bool,
    restart_requested: Option<RestartMode>,
    wins: Vec<u32>,
    survived_turns: Vec<u64>,
    rounds_completed: u32,
}

impl Scheduler {
    fn new(
        state: BattleState,
        roster: Vec<RobotSpec>,
        observers: Vec<Box<dyn BattleObserver>>,
        commands: CommandReceiver,
    ) -> Self {
        let robot_count = roster.len();
        let governor = ResourceGovernor::new(
            robot_count,
            state.config().cpu_quota,
            state.config().data_quota_bytes,
        );
        Self {
            state,
            roster,
            observers,
            commands,
            governor: Arc::new(Mutex::new(governor)),
            phase: SchedulerPhase::Idle,
            pause_depth: 0,
            paused_notified: false,
            steps_pending: 0,
            stop_requested: false,
            restart_requested: None,
            wins: vec![0; robot_count],
            survived_turns: vec![0; robot_count],
            rounds_completed: 0,
        }
    }

    fn set_phase(&mut self, phase: SchedulerPhase) {
        if self.phase != phase {
            debug!(?phase, "scheduler phase change");
            self.phase = phase;
        }
    }

    fn run(mut self) -> BattleResult {
        let config = self.state.config().clone();
        let names = self.state.names().to_vec();
        for observer in &mut self.observers {
            observer.on_battle_started(&config, &names);
        }
        info!(
            robots = names.len(),
            rounds = config.rounds,
            seed = self.state.effective_seed(),
            "battle started",
        );

        'battle: loop {
            let mut round = 0;
            while round < self.state.config().rounds {
                match self.run_round(round) {
                    RoundExit::Completed => {
                        self.rounds_completed += 1;
                        round += 1;
                    }
                    RoundExit::Stopped => break 'battle,
                    RoundExit::Restart(mode) => {
                        self.reset_battle(mode);
                        continue 'battle;
                    }
                }
            }
            break;
        }

        self.set_phase(SchedulerPhase::BattleFinished);
        let result = BattleResult {
            names,
            rounds_completed: self.rounds_completed,
            wins: self.wins.clone(),
            survived_turns: self.survived_turns.clone(),
            effective_seed: self.state.effective_seed(),
        };
        for observer in &mut self.observers {
            observer.on_battle_finished(&result);
        }
        info!(rounds = result.rounds_completed, "battle finished");
        result
    }

    fn reset_battle(&mut self, mode: RestartMode) {
        let mut config = self.state.config().clone();
        if matches!(mode, RestartMode::Replay) {
            config.rng_seed = Some(self.state.effective_seed());
        }
        let names = self.state.names().to_vec();
        // The configuration was validated at battle start, so this cannot
        // fail; keep the old state on the defensive arm regardless.
        if let Ok(state) = BattleState::new(config, names) {
            self.state = state;
        }
        self.wins.fill(0);
        self.survived_turns.fill(0);
        self.rounds_completed = 0;
        self.steps_pending = 0;
        self.stop_requested = false;
        self.restart_requested = None;
        info!(?mode, "battle reset");
    }

    fn run_round(&mut self, round: u32) -> RoundExit {
        self.set_phase(SchedulerPhase::RoundStarting);
        self.state.begin_round(round);
        relock(&self.governor).begin_round();

        let robot_count = self.roster.len();
        let wiring = Arc::new(BattleWiring::new(
            self.state.names().to_vec(),
            self.roster.iter().map(|spec| spec.team.clone()).collect(),
            (0..robot_count).map(|i| self.state.status_of(i)).collect(),
            (
                self.state.config().arena_width,
                self.state.config().arena_height,
            ),
        ));
        let barrier = ExecutionBarrier::new(robot_count);

        let mut threads = Vec::with_capacity(robot_count);
        let mut spawn_failures = Vec::new();
        for index in 0..robot_count {
            let spec = &self.roster[index];
            match spawn_controller(
                spec,
                index,
                Arc::clone(&wiring),
                barrier.clone(),
                Arc::clone(&self.governor),
            ) {
                Ok(handle) => threads.push(Some(handle)),
                Err(err) => {
                    warn!(robot = index, error = %err, "failed to spawn controller");
                    threads.push(None);
                    spawn_failures.push(index);
                }
            }
        }
        for index in spawn_failures {
            self.kill_robot(index, &wiring, &barrier);
        }

        for observer in &mut self.observers {
            observer.on_round_started(round);
        }
        info!(round, "round started");
        self.set_phase(SchedulerPhase::TurnRunning);

        let exit = self.turn_loop(&wiring, &barrier);
        if matches!(exit, RoundExit::Completed) {
            self.finish_round(round, &wiring);
        }

        barrier.shutdown();
        for handle in threads.into_iter().flatten() {
            let _ = handle.join();
        }
        self.set_phase(SchedulerPhase::RoundEnded);
        debug!(round, turns = self.state.turn().0, "round ended");
        exit
    }

    fn turn_loop(&mut self, wiring: &Arc<BattleWiring>, barrier: &ExecutionBarrier) -> RoundExit {
        loop {
            for command in drain_pending_commands(&self.commands) {
                self.apply_command(command, wiring, barrier);
            }
            if self.stop_requested {
                return RoundExit::Stopped;
            }
            if let Some(mode) = self.restart_requested.take() {
                return RoundExit::Restart(mode);
            }

            // Reference-counted pause gate; a queued single-step lets
            // exactly one turn through before re-entering it.
            while self.pause_depth > 0 && self.steps_pending == 0 {
                if !self.paused_notified {
                    self.paused_notified = true;
                    self.set_phase(SchedulerPhase::Paused);
                    for observer in &mut self.observers {
                        observer.on_battle_paused();
                    }
                    info!("battle paused");
                }
                match self.commands.recv() {
                    Ok(command) => self.apply_command(command, wiring, barrier),
                    Err(_) => self.stop_requested = true,
                }
                if self.stop_requested {
                    return RoundExit::Stopped;
                }
                if let Some(mode) = self.restart_requested.take() {
                    return RoundExit::Restart(mode);
                }
            }
            if self.paused_notified && self.pause_depth == 0 {
                self.paused_notified = false;
                self.set_phase(SchedulerPhase::TurnRunning);
                for observer in &mut self.observers {
                    observer.on_battle_resumed();
                }
                info!("battle resumed");
            }
            if self.steps_pending > 0 {
                self.steps_pending -= 1;
            }

            self.pre_turn(wiring, barrier);
            if self.state.round_over() {
                return RoundExit::Completed;
            }

            let turn_id = self.state.turn().0 + 1;
            barrier.open(turn_id);
            let outcome = barrier.collect(&self.governor);

            let mut to_kill = Vec::new();
            {
                let mut governor = relock(&self.governor);
                for &robot in &outcome.cut {
                    if !self.state.robot(robot).lifecycle.is_alive() {
                        continue;
                    }
                    let streak = governor.record_skip(robot);
                    relock(&wiring.robots[robot].queue).push(EventKind::SkippedTurn, Turn(turn_id));
                    warn!(robot, streak, turn = turn_id, "robot missed its commit window");
                    if streak >= self.state.config().max_consecutive_skipped_turns {
                        to_kill.push(robot);
                    }
                }
                for (robot, slot) in outcome.commands.iter().enumerate() {
                    if slot.is_some() {
                        governor.record_commit(robot);
                    }
                }
            }
            for robot in to_kill {
                warn!(robot, "removing robot after repeated skipped turns");
                self.kill_robot(robot, wiring, barrier);
            }

            let record = self.state.resolve_turn(&outcome.commands);
            let turn = record.turn;
            for (robot, kind) in record.events {
                relock(&wiring.robots[robot].queue).push(kind, turn);
            }
            for &victim in &record.deaths {
                barrier.mark_killed(victim);
            }
            for (index, channels) in wiring.robots.iter().enumerate() {
                *relock(&channels.status) = self.state.status_of(index);
            }
            for (index, robot) in self.state.robots().iter().enumerate() {
                if robot.lifecycle.is_alive() {
                    self.survived_turns[index] += 1;
                }
            }

            let mut snapshot = self.state.snapshot();
            for (index, robot_snapshot) in snapshot.robots.iter_mut().enumerate() {
                robot_snapshot.pending_events = relock(&wiring.robots[index].queue)
                    .iter()
                    .map(|event| event.kind.class().name().to_owned())
                    .collect();
            }
            for observer in &mut self.observers {
                observer.on_turn_ended(&snapshot);
            }

            for (index, channels) in wiring.robots.iter().enumerate() {
                if self.state.robot(index).lifecycle.is_alive()
                    && !channels.activity.swap(false, Ordering::Relaxed)
                {
                    debug!(robot = index, turn = turn.0, "robot not responding");
                }
            }

            if self.state.round_over() {
                return RoundExit::Completed;
            }
        }
    }

    /// Pre-barrier housekeeping: surface controller faults, prune stale
    /// events, and evaluate custom-event conditions against fresh status
    /// views.
    fn pre_turn(&mut self, wiring: &Arc<BattleWiring>, barrier: &ExecutionBarrier) {
        let turn = self.state.turn();
        for index in 0..wiring.robots.len() {
            if !self.state.robot(index).lifecycle.is_alive() {
                continue;
            }
            let fault = relock(&wiring.robots[index].fault).take();
            if let Some(fault) = fault {
                match &fault {
                    Fault::Sandbox(message) => {
                        warn!(robot = index, %message, "sandbox violation; removing robot");
                    }
                    Fault::Panic(message) => {
                        warn!(robot = index, %message, "hosted code panicked; removing robot");
                    }
                    Fault::Error(message) => {
                        warn!(robot = index, %message, "hosted code failed; removing robot");
                    }
                }
                self.kill_robot(index, wiring, barrier);
                continue;
            }

            let status = self.state.status_of(index);
            let mut queue = relock(&wiring.robots[index].queue);
            queue.prune_stale(turn);
            let evaluated = panic::catch_unwind(AssertUnwindSafe(|| {
                queue.evaluate_conditions(&status, turn)
            }));
            drop(queue);
            if evaluated.is_err() {
                warn!(robot = index, "condition predicate panicked; removing robot");
                self.kill_robot(index, wiring, barrier);
            }
        }
    }

    fn apply_command(
        &mut self,
        command: ControlCommand,
        wiring: &Arc<BattleWiring>,
        barrier: &ExecutionBarrier,
    ) {
        match command {
            ControlCommand::Pause => self.pause_depth += 1,
            ControlCommand::Resume => self.pause_depth = self.pause_depth.saturating_sub(1),
            ControlCommand::SingleStep => {
                if self.pause_depth > 0 {
                    self.steps_pending += 1;
                }
            }
            ControlCommand::Stop => self.stop_requested = true,
            ControlCommand::Kill { robot } => {
                if robot < self.roster.len() {
                    info!(robot, "kill requested");
                    self.kill_robot(robot, wiring, barrier);
                } else {
                    warn!(robot, "kill requested for unknown robot index");
                }
            }
            ControlCommand::Restart => self.restart_requested = Some(RestartMode::Fresh),
            ControlCommand::Replay => self.restart_requested = Some(RestartMode::Replay),
        }
    }

    fn kill_robot(
        &mut self,
        index: usize,
        wiring: &Arc<BattleWiring>,
        barrier: &ExecutionBarrier,
    ) {
        let events = self.state.kill(index);
        if events.is_empty() {
            return;
        }
        let turn = self.state.turn();
        for (robot, kind) in events {
            relock(&wiring.robots[robot].queue).push(kind, turn);
        }
        barrier.mark_killed(index);
        *relock(&wiring.robots[index].status) = self.state.status_of(index);
    }

    fn finish_round(&mut self, round: u32, wiring: &Arc<BattleWiring>) {
        let turn = self.state.turn();
        let alive: Vec<usize> = self
            .state
            .robots()
            .iter()
            .enumerate()
            .filter(|(_, robot)| robot.lifecycle.is_alive())
            .map(|(index, _)| index)
            .collect();
        if let [winner] = alive.as_slice() {
            self.wins[*winner] += 1;
            relock(&wiring.robots[*winner].queue).push(EventKind::Win, turn);
            info!(round, winner, "round won");
        }
        for &index in &alive {
            relock(&wiring.robots[index].queue).push(EventKind::RoundEnded, turn);
        }
    }
}

fn relock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
