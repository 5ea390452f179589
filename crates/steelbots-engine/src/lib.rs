//! Hosted-execution layer for Steelbots.
//!
//! One scheduler thread drives the deterministic battle model from
//! `steelbots-core`; every robot program runs on its own thread behind a
//! capability-scoped [`Peer`] handle. Robots never touch shared world state:
//! they read their own last-committed status, receive events, and stage
//! commands that the scheduler applies in a fixed order.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use steelbots_core::{ConfigError, DataQuotaError, Event, EventError};
use thiserror::Error;

pub mod barrier;
pub mod command;
mod controller;
mod scheduler;

pub use barrier::{BarrierOutcome, BarrierPhase, ExecutionBarrier};
pub use command::{CommandReceiver, CommandSender, create_command_bus, drain_pending_commands};
pub use controller::Peer;
pub use scheduler::{BattleHandle, start_battle};

/// Peer-surface tier a robot program is granted at construction.
///
/// Levels are strictly ordered: every tier includes the surfaces below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Combined move+turn primitive, firing, and queries.
    Junior,
    /// Independent blocking body/gun/radar control and event handlers.
    Standard,
    /// Deferred commands, `execute`, custom events, priorities, and the
    /// private data area.
    Advanced,
    /// Everything above plus intra-team messaging.
    Team,
}

/// Error surfaced by peer calls.
///
/// `Interrupted`, `Killed`, and `RoundOver` are control-flow signals: robot
/// code is expected to propagate them with `?` so the controller can unwind
/// the thread cleanly. The remaining variants report invalid calls back to
/// the robot that made them; letting one escape `run` counts as a hosted
/// fault and removes the robot from the round.
#[derive(Debug, Error)]
pub enum RobotError {
    #[error("event handler interrupted by a newer event of equal or higher priority")]
    Interrupted,
    #[error("robot has been destroyed")]
    Killed,
    #[error("round has ended")]
    RoundOver,
    #[error("call requires capability level {required:?}")]
    CapabilityDenied { required: Capability },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    DataQuota(#[from] DataQuotaError),
}

/// A hosted robot program.
///
/// `run` is invoked once per round on the robot's own thread. Blocking peer
/// calls take `&mut dyn Robot` (pass `self`) so queued events can be
/// dispatched to [`Robot::on_event`] while the program is suspended.
pub trait Robot: Send {
    /// Main program body. Returning early is fine; the controller keeps
    /// committing empty turns and delivering events afterwards.
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError>;

    /// Event handler, called between turns in priority order.
    fn on_event(&mut self, event: &Event, peer: &mut Peer) -> Result<(), RobotError> {
        let _ = (event, peer);
        Ok(())
    }
}

/// Factory producing a fresh program instance at every round start.
pub type RobotFactory = Arc<dyn Fn() -> Box<dyn Robot> + Send + Sync>;

/// Loadable unit of hosted code plus its static metadata.
#[derive(Clone)]
pub struct RobotSpec {
    pub name: String,
    pub capability: Capability,
    pub team: Option<String>,
    factory: RobotFactory,
}

impl RobotSpec {
    pub fn new<F>(name: impl Into<String>, capability: Capability, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Robot> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            capability,
            team: None,
            factory: Arc::new(factory),
        }
    }

    /// Tag this robot as part of a named team.
    #[must_use]
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Instantiate a fresh program for a new round.
    #[must_use]
    pub fn instantiate(&self) -> Box<dyn Robot> {
        (self.factory)()
    }

    pub(crate) fn factory_handle(&self) -> RobotFactory {
        Arc::clone(&self.factory)
    }
}

impl fmt::Debug for RobotSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotSpec")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("team", &self.team)
            .finish()
    }
}

/// Errors that prevent a battle from starting or finishing.
#[derive(Debug, Error)]
pub enum BattleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("scheduler thread panicked")]
    SchedulerPanicked,
}

/// Errors from the external control surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("command queue is full; retry later")]
    CommandQueueFull,
    #[error("command queue has been closed")]
    CommandQueueClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_levels_are_ordered() {
        assert!(Capability::Junior < Capability::Standard);
        assert!(Capability::Standard < Capability::Advanced);
        assert!(Capability::Advanced < Capability::Team);
    }

    #[test]
    fn robot_spec_instantiates_fresh_programs() {
        struct Noop;
        impl Robot for Noop {
            fn run(&mut self, _peer: &mut Peer) -> Result<(), RobotError> {
                Ok(())
            }
        }
        let spec = RobotSpec::new("noop", Capability::Junior, || Box::new(Noop));
        let _first = spec.instantiate();
        let _second = spec.instantiate();
        assert_eq!(spec.team, None);
        let teamed = spec.clone().with_team("reds");
        assert_eq!(teamed.team.as_deref(), Some("reds"));
    }
}
