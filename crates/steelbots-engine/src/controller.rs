//! Robot controllers: one hosted thread per robot behind a capability-scoped
//! peer handle.
//!
//! The peer is the only channel between hosted code and the battle. Query
//! calls read the robot's last-committed status view and never block.
//! Deferred calls stage commands with last-write-wins semantics. Blocking
//! calls commit the staged bundle at the execution barrier and suspend until
//! the next turn opens; they take `&mut dyn Robot` so that queued events can
//! be dispatched to the program while it is parked between turns.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use steelbots_core::{
    Condition, Event, EventClass, EventKind, EventQueue, PendingCommands, ResourceGovernor,
    RobotStatus, Turn,
};
use tracing::debug;

use crate::barrier::ExecutionBarrier;
use crate::{Capability, Robot, RobotError, RobotSpec};

const EPS: f64 = 1e-9;

/// Why a controller thread stopped participating.
#[derive(Debug)]
pub(crate) enum Fault {
    Panic(String),
    Error(String),
    Sandbox(String),
}

/// Mailboxes shared between one controller thread and the scheduler.
pub(crate) struct RobotChannels {
    pub queue: Mutex<EventQueue>,
    pub staging: Mutex<PendingCommands>,
    pub status: Mutex<RobotStatus>,
    pub activity: AtomicBool,
    pub fault: Mutex<Option<Fault>>,
}

/// Per-round wiring connecting the scheduler with every controller.
pub(crate) struct BattleWiring {
    pub names: Vec<String>,
    pub teams: Vec<Option<String>>,
    pub robots: Vec<RobotChannels>,
    pub arena: (f64, f64),
}

impl BattleWiring {
    pub(crate) fn new(
        names: Vec<String>,
        teams: Vec<Option<String>>,
        statuses: Vec<RobotStatus>,
        arena: (f64, f64),
    ) -> Self {
        let robots = statuses
            .into_iter()
            .map(|status| RobotChannels {
                queue: Mutex::new(EventQueue::new()),
                staging: Mutex::new(PendingCommands::default()),
                status: Mutex::new(status),
                activity: AtomicBool::new(false),
                fault: Mutex::new(None),
            })
            .collect();
        Self {
            names,
            teams,
            robots,
            arena,
        }
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Capability-scoped API surface handed to hosted robot code.
pub struct Peer {
    index: usize,
    capability: Capability,
    wiring: Arc<BattleWiring>,
    barrier: ExecutionBarrier,
    governor: Arc<Mutex<ResourceGovernor>>,
    current_turn: u64,
    /// Priority and arrival watermark of the handler currently running.
    dispatch_floor: Option<(i32, u64)>,
    death_delivered: bool,
}

impl Peer {
    pub(crate) fn new(
        index: usize,
        capability: Capability,
        wiring: Arc<BattleWiring>,
        barrier: ExecutionBarrier,
        governor: Arc<Mutex<ResourceGovernor>>,
    ) -> Self {
        Self {
            index,
            capability,
            wiring,
            barrier,
            governor,
            current_turn: 0,
            dispatch_floor: None,
            death_delivered: false,
        }
    }

    fn channels(&self) -> &RobotChannels {
        &self.wiring.robots[self.index]
    }

    fn mark_activity(&self) {
        self.channels().activity.store(true, Ordering::Relaxed);
    }

    fn require(&self, required: Capability) -> Result<(), RobotError> {
        if self.capability >= required {
            Ok(())
        } else {
            Err(RobotError::CapabilityDenied { required })
        }
    }

    fn finite(value: f64, what: &'static str) -> Result<(), RobotError> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(RobotError::InvalidArgument(what))
        }
    }

    fn raw_status(&self) -> RobotStatus {
        *relock(&self.channels().status)
    }

    // ----- query calls -------------------------------------------------

    /// Status view as of the last committed turn.
    #[must_use]
    pub fn status(&self) -> RobotStatus {
        self.mark_activity();
        self.raw_status()
    }

    #[must_use]
    pub fn x(&self) -> f64 {
        self.status().x
    }

    #[must_use]
    pub fn y(&self) -> f64 {
        self.status().y
    }

    #[must_use]
    pub fn heading(&self) -> f64 {
        self.status().body_heading
    }

    #[must_use]
    pub fn gun_heading(&self) -> f64 {
        self.status().gun_heading
    }

    #[must_use]
    pub fn radar_heading(&self) -> f64 {
        self.status().radar_heading
    }

    #[must_use]
    pub fn velocity(&self) -> f64 {
        self.status().velocity
    }

    #[must_use]
    pub fn energy(&self) -> f64 {
        self.status().energy
    }

    #[must_use]
    pub fn gun_heat(&self) -> f64 {
        self.status().gun_heat
    }

    #[must_use]
    pub fn distance_remaining(&self) -> f64 {
        self.status().distance_remaining
    }

    #[must_use]
    pub fn turn_remaining(&self) -> f64 {
        self.status().body_turn_remaining
    }

    #[must_use]
    pub fn gun_turn_remaining(&self) -> f64 {
        self.status().gun_turn_remaining
    }

    #[must_use]
    pub fn radar_turn_remaining(&self) -> f64 {
        self.status().radar_turn_remaining
    }

    #[must_use]
    pub fn others_alive(&self) -> u32 {
        self.status().others_alive
    }

    #[must_use]
    pub fn round(&self) -> u32 {
        self.status().round
    }

    #[must_use]
    pub fn turn(&self) -> u64 {
        self.mark_activity();
        self.current_turn
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.wiring.names[self.index]
    }

    #[must_use]
    pub fn arena_width(&self) -> f64 {
        self.wiring.arena.0
    }

    #[must_use]
    pub fn arena_height(&self) -> f64 {
        self.wiring.arena.1
    }

    #[must_use]
    pub fn capability(&self) -> Capability {
        self.capability
    }

    // ----- deferred calls ----------------------------------------------

    pub fn set_move(&mut self, distance: f64) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        Self::finite(distance, "move distance must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_move(distance);
        Ok(())
    }

    pub fn set_turn_body(&mut self, angle: f64) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        Self::finite(angle, "body turn must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_turn_body(angle);
        Ok(())
    }

    pub fn set_turn_gun(&mut self, angle: f64) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        Self::finite(angle, "gun turn must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_turn_gun(angle);
        Ok(())
    }

    pub fn set_turn_radar(&mut self, angle: f64) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        Self::finite(angle, "radar turn must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_turn_radar(angle);
        Ok(())
    }

    pub fn set_fire(&mut self, power: f64) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        Self::finite(power, "fire power must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_fire(power);
        Ok(())
    }

    pub fn set_body_color(&mut self, color: [f32; 3]) -> Result<(), RobotError> {
        self.mark_activity();
        relock(&self.channels().staging).set_body_color(color);
        Ok(())
    }

    pub fn set_gun_color(&mut self, color: [f32; 3]) -> Result<(), RobotError> {
        self.mark_activity();
        relock(&self.channels().staging).set_gun_color(color);
        Ok(())
    }

    pub fn set_radar_color(&mut self, color: [f32; 3]) -> Result<(), RobotError> {
        self.mark_activity();
        relock(&self.channels().staging).set_radar_color(color);
        Ok(())
    }

    // ----- commit and blocking calls ------------------------------------

    /// Flush staged commands and suspend until the next turn. Queued events
    /// are dispatched before this returns.
    pub fn execute(&mut self, robot: &mut dyn Robot) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        self.commit_turn(robot)
    }

    /// Commit an empty turn; the lowest-tier way to let time pass.
    pub fn do_nothing(&mut self, robot: &mut dyn Robot) -> Result<(), RobotError> {
        self.commit_turn(robot)
    }

    /// Combined move+turn primitive available to every tier.
    pub fn drive(
        &mut self,
        robot: &mut dyn Robot,
        distance: f64,
        turn: f64,
    ) -> Result<(), RobotError> {
        Self::finite(distance, "move distance must be finite")?;
        Self::finite(turn, "body turn must be finite")?;
        self.mark_activity();
        {
            let mut staging = relock(&self.channels().staging);
            staging.set_move(distance);
            staging.set_turn_body(turn);
        }
        self.commit_turn(robot)?;
        loop {
            let status = self.raw_status();
            if status.distance_remaining.abs() <= EPS && status.body_turn_remaining.abs() <= EPS {
                return Ok(());
            }
            self.commit_turn(robot)?;
        }
    }

    /// Move forward, blocking across turns until the distance is covered.
    pub fn ahead(&mut self, robot: &mut dyn Robot, distance: f64) -> Result<(), RobotError> {
        self.require(Capability::Standard)?;
        Self::finite(distance, "move distance must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_move(distance);
        self.block_until(robot, |status| status.distance_remaining.abs() <= EPS)
    }

    /// Move backward, blocking across turns until the distance is covered.
    pub fn back(&mut self, robot: &mut dyn Robot, distance: f64) -> Result<(), RobotError> {
        self.ahead(robot, -distance)
    }

    /// Rotate the body, blocking across turns until done.
    pub fn turn_body(&mut self, robot: &mut dyn Robot, angle: f64) -> Result<(), RobotError> {
        self.require(Capability::Standard)?;
        Self::finite(angle, "body turn must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_turn_body(angle);
        self.block_until(robot, |status| status.body_turn_remaining.abs() <= EPS)
    }

    /// Rotate the gun, blocking across turns until done.
    pub fn turn_gun(&mut self, robot: &mut dyn Robot, angle: f64) -> Result<(), RobotError> {
        self.require(Capability::Standard)?;
        Self::finite(angle, "gun turn must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_turn_gun(angle);
        self.block_until(robot, |status| status.gun_turn_remaining.abs() <= EPS)
    }

    /// Rotate the radar, blocking across turns until done.
    pub fn turn_radar(&mut self, robot: &mut dyn Robot, angle: f64) -> Result<(), RobotError> {
        self.require(Capability::Standard)?;
        Self::finite(angle, "radar turn must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_turn_radar(angle);
        self.block_until(robot, |status| status.radar_turn_remaining.abs() <= EPS)
    }

    /// Fire the gun this turn if it is cool; a hot gun wastes the call.
    pub fn fire(&mut self, robot: &mut dyn Robot, power: f64) -> Result<(), RobotError> {
        Self::finite(power, "fire power must be finite")?;
        self.mark_activity();
        relock(&self.channels().staging).set_fire(power);
        self.commit_turn(robot)
    }

    /// Suspend until the condition evaluates true, committing a turn per
    /// check and draining events in between.
    pub fn wait_for(
        &mut self,
        robot: &mut dyn Robot,
        condition: &mut dyn Condition,
    ) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        loop {
            self.commit_turn(robot)?;
            let status = self.raw_status();
            if condition.test(&status) {
                return Ok(());
            }
        }
    }

    fn block_until(
        &mut self,
        robot: &mut dyn Robot,
        done: impl Fn(&RobotStatus) -> bool,
    ) -> Result<(), RobotError> {
        self.commit_turn(robot)?;
        loop {
            let status = self.raw_status();
            if done(&status) {
                return Ok(());
            }
            self.commit_turn(robot)?;
        }
    }

    fn commit_turn(&mut self, robot: &mut dyn Robot) -> Result<(), RobotError> {
        let commands = relock(&self.channels().staging).take();
        self.barrier.commit(self.index, commands);
        let next = match self.barrier.await_turn(self.index, self.current_turn) {
            Ok(turn) => turn,
            Err(RobotError::Killed) => {
                self.deliver_death(robot);
                return Err(RobotError::Killed);
            }
            Err(err) => return Err(err),
        };
        self.current_turn = next;
        if let Some((floor, since)) = self.dispatch_floor {
            // Inside a handler nothing is dispatched; a newer arrival at or
            // above the handler's priority aborts it when interruptible.
            let queue = relock(&self.channels().queue);
            if queue.interruptible() && queue.has_arrival_at_least(floor, since) {
                return Err(RobotError::Interrupted);
            }
            return Ok(());
        }
        self.dispatch_events(robot)
    }

    fn dispatch_events(&mut self, robot: &mut dyn Robot) -> Result<(), RobotError> {
        loop {
            let (event, watermark) = {
                let mut queue = relock(&self.channels().queue);
                let event = queue.pop_delivered();
                // Interruptibility never carries over between handlers.
                queue.set_interruptible(false);
                (event, queue.next_seq())
            };
            let Some(event) = event else {
                return Ok(());
            };
            self.dispatch_floor = Some((event.priority, watermark));
            let outcome = robot.on_event(&event, self);
            self.dispatch_floor = None;
            match outcome {
                Ok(()) => {}
                // The abandoned handler unwound; restart delivery from the
                // new highest-priority event.
                Err(RobotError::Interrupted) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn deliver_death(&mut self, robot: &mut dyn Robot) {
        if self.death_delivered {
            return;
        }
        self.death_delivered = true;
        let event = relock(&self.channels().queue).take_class(EventClass::Death);
        if let Some(event) = event {
            let saved = self.dispatch_floor;
            self.dispatch_floor = Some((event.priority, u64::MAX));
            let _ = robot.on_event(&event, self);
            self.dispatch_floor = saved;
        }
    }

    // ----- event-queue surface ------------------------------------------

    /// Register a condition whose satisfaction fires a custom event.
    pub fn add_custom_event(&mut self, condition: Box<dyn Condition>) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        self.mark_activity();
        relock(&self.channels().queue).register_condition(condition)?;
        Ok(())
    }

    /// Remove a registered condition by name.
    pub fn remove_custom_event(&mut self, name: &str) -> Result<bool, RobotError> {
        self.require(Capability::Advanced)?;
        self.mark_activity();
        Ok(relock(&self.channels().queue).remove_condition(name))
    }

    /// Override the delivery priority of an ordinary event class.
    pub fn set_event_priority(&mut self, class_name: &str, priority: i32) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        relock(&self.channels().queue).set_class_priority(class_name, priority)?;
        Ok(())
    }

    /// Current delivery priority of an event class.
    pub fn event_priority(&self, class_name: &str) -> Result<i32, RobotError> {
        self.require(Capability::Advanced)?;
        Ok(relock(&self.channels().queue).class_priority(class_name)?)
    }

    /// Allow the currently running handler to be preempted.
    pub fn set_interruptible(&mut self, interruptible: bool) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        relock(&self.channels().queue).set_interruptible(interruptible);
        Ok(())
    }

    /// Drop every queued event.
    pub fn clear_all_events(&mut self) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        relock(&self.channels().queue).clear_all();
        Ok(())
    }

    /// Copies of every queued, undelivered event.
    pub fn events(&self) -> Result<Vec<Event>, RobotError> {
        self.require(Capability::Advanced)?;
        Ok(relock(&self.channels().queue).iter().cloned().collect())
    }

    // ----- data area ----------------------------------------------------

    /// Append bytes to this robot's private data area.
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<(), RobotError> {
        self.require(Capability::Advanced)?;
        self.mark_activity();
        relock(&self.governor).write_data(self.index, bytes)?;
        Ok(())
    }

    /// Contents of this robot's private data area.
    pub fn data(&self) -> Result<Vec<u8>, RobotError> {
        self.require(Capability::Advanced)?;
        Ok(relock(&self.governor).data(self.index).to_vec())
    }

    /// Bytes still available in this robot's data area.
    pub fn data_quota_remaining(&self) -> Result<usize, RobotError> {
        self.require(Capability::Advanced)?;
        Ok(relock(&self.governor).data_quota_remaining(self.index))
    }

    // ----- team messaging -----------------------------------------------

    /// Names of living or dead teammates, excluding this robot.
    pub fn teammates(&self) -> Result<Vec<String>, RobotError> {
        self.require(Capability::Team)?;
        Ok(self.teammate_indices().map(|i| self.wiring.names[i].clone()).collect())
    }

    /// Send a message to every teammate; delivery happens with the next
    /// event drain on their side.
    pub fn broadcast(&mut self, payload: &[u8]) -> Result<(), RobotError> {
        self.require(Capability::Team)?;
        self.mark_activity();
        let indices: Vec<usize> = self.teammate_indices().collect();
        for target in indices {
            self.post_message(target, payload);
        }
        Ok(())
    }

    /// Send a message to one named teammate.
    pub fn send_to(&mut self, teammate: &str, payload: &[u8]) -> Result<(), RobotError> {
        self.require(Capability::Team)?;
        self.mark_activity();
        let target = self
            .teammate_indices()
            .find(|&i| self.wiring.names[i] == teammate)
            .ok_or(RobotError::InvalidArgument("unknown teammate"))?;
        self.post_message(target, payload);
        Ok(())
    }

    fn teammate_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let own_team = self.wiring.teams[self.index].clone();
        self.wiring
            .teams
            .iter()
            .enumerate()
            .filter(move |(i, team)| {
                *i != self.index && own_team.is_some() && **team == own_team
            })
            .map(|(i, _)| i)
    }

    fn post_message(&self, target: usize, payload: &[u8]) {
        relock(&self.wiring.robots[target].queue).push(
            EventKind::Message {
                from: self.index,
                payload: payload.to_vec(),
            },
            Turn(self.current_turn),
        );
    }

    // ----- controller internals -----------------------------------------

    pub(crate) fn wait_first_turn(&mut self) -> Result<(), RobotError> {
        self.current_turn = self.barrier.await_turn(self.index, 0)?;
        Ok(())
    }

    pub(crate) fn idle(&mut self, robot: &mut dyn Robot) -> Result<(), RobotError> {
        loop {
            match self.commit_turn(robot) {
                Ok(()) => {}
                Err(RobotError::Killed | RobotError::RoundOver) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

fn host_program(program: &mut dyn Robot, peer: &mut Peer) -> Result<(), RobotError> {
    peer.wait_first_turn()?;
    match program.run(peer) {
        // A program that returns keeps receiving events and passing turns.
        Ok(()) | Err(RobotError::Interrupted) => peer.idle(program),
        Err(RobotError::Killed | RobotError::RoundOver) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Spawn the hosted thread for one robot. Panics and escaped errors are
/// absorbed here and surfaced to the scheduler through the fault mailbox.
pub(crate) fn spawn_controller(
    spec: &RobotSpec,
    index: usize,
    wiring: Arc<BattleWiring>,
    barrier: ExecutionBarrier,
    governor: Arc<Mutex<ResourceGovernor>>,
) -> io::Result<JoinHandle<()>> {
    let capability = spec.capability;
    let factory = spec.factory_handle();
    std::thread::Builder::new()
        .name(format!("robot-{index}-{}", spec.name))
        .spawn(move || {
            let fault_wiring = Arc::clone(&wiring);
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                let mut program = factory();
                let mut peer = Peer::new(index, capability, wiring, barrier, governor);
                host_program(&mut *program, &mut peer)
            }));
            match outcome {
                Ok(Ok(())) => debug!(robot = index, "controller finished"),
                Ok(Err(err)) => {
                    let fault = if matches!(err, RobotError::DataQuota(_)) {
                        Fault::Sandbox(err.to_string())
                    } else {
                        Fault::Error(err.to_string())
                    };
                    *relock(&fault_wiring.robots[index].fault) = Some(fault);
                }
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_owned());
                    *relock(&fault_wiring.robots[index].fault) = Some(Fault::Panic(message));
                }
            }
        })
}
