//! Control facade over a running battle, shared by the CLI and any future
//! remote surfaces. Mutation goes through the command bus and takes effect
//! at turn boundaries; queries read the latest published snapshot.

use std::sync::{Arc, Mutex};

use crossfire::TrySendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use steelbots_core::{ControlCommand, RobotLifecycle, SnapshotRecorder, TurnSnapshot};
use steelbots_engine::CommandSender;

/// Errors produced by the control facade.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("command queue is full; retry later")]
    CommandQueueFull,
    #[error("command queue has been closed")]
    CommandQueueClosed,
    #[error("no snapshot has been published yet")]
    NoSnapshot,
    #[error("failed to lock snapshot recorder")]
    Lock,
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Condensed battle status for external clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleStatus {
    pub round: u32,
    pub turn: u64,
    pub alive: u32,
    pub robots: Vec<RobotEntry>,
}

/// One roster line in a [`BattleStatus`] or scoreboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotEntry {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub energy: f64,
    pub state: String,
    pub pending_events: usize,
}

fn lifecycle_label(lifecycle: RobotLifecycle) -> &'static str {
    match lifecycle {
        RobotLifecycle::Active => "active",
        RobotLifecycle::Disabled => "disabled",
        RobotLifecycle::Dead => "dead",
    }
}

impl BattleStatus {
    fn from_snapshot(snapshot: &TurnSnapshot) -> Self {
        Self {
            round: snapshot.round,
            turn: snapshot.turn.0,
            alive: snapshot.alive_count,
            robots: snapshot
                .robots
                .iter()
                .map(|robot| RobotEntry {
                    name: robot.name.clone(),
                    x: robot.x,
                    y: robot.y,
                    energy: robot.energy,
                    state: lifecycle_label(robot.state).to_owned(),
                    pending_events: robot.pending_events.len(),
                })
                .collect(),
        }
    }
}

/// Shared handle used to steer and inspect a running battle.
#[derive(Clone)]
pub struct ControlHandle {
    commands: CommandSender,
    recorder: Arc<Mutex<SnapshotRecorder>>,
}

impl ControlHandle {
    pub fn new(commands: CommandSender, recorder: Arc<Mutex<SnapshotRecorder>>) -> Self {
        Self { commands, recorder }
    }

    fn enqueue(&self, command: ControlCommand) -> Result<(), ControlError> {
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

    pub fn replay(&self) -> Result<(), ControlError> {
        self.enqueue(ControlCommand::Replay)
    }

    /// Status derived from the most recent published snapshot.
    pub fn status(&self) -> Result<BattleStatus, ControlError> {
        let recorder = self.recorder.lock().map_err(|_| ControlError::Lock)?;
        recorder
            .latest()
            .map(BattleStatus::from_snapshot)
            .ok_or(ControlError::NoSnapshot)
    }

    /// Status as a JSON value, for line-oriented tooling.
    pub fn status_json(&self) -> Result<Value, ControlError> {
        let status = self.status()?;
        serde_json::to_value(&status).map_err(|err| ControlError::Serialization(err.to_string()))
    }

    /// Roster sorted by energy, strongest first; name breaks ties.
    pub fn scoreboard(&self) -> Result<Vec<RobotEntry>, ControlError> {
        let mut entries = self.status()?.robots;
        entries.sort_by(|a, b| {
            b.energy
                .total_cmp(&a.energy)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steelbots_core::{BattleObserver, RobotSnapshot, Turn};
    use steelbots_engine::create_command_bus;

    fn snapshot() -> TurnSnapshot {
        let robot = |name: &str, energy: f64| RobotSnapshot {
            name: name.to_owned(),
            x: 10.0,
            y: 20.0,
            body_heading: 0.0,
            gun_heading: 0.0,
            radar_heading: 0.0,
            velocity: 0.0,
            energy,
            gun_heat: 0.0,
            state: RobotLifecycle::Active,
            pending_events: vec!["status".to_owned()],
        };
        TurnSnapshot {
            round: 2,
            turn: Turn(17),
            alive_count: 2,
            robots: vec![robot("weak", 35.0), robot("strong", 90.0)],
        }
    }

    fn handle_with_snapshot() -> ControlHandle {
        let (sender, _receiver) = create_command_bus(4);
        let mut recorder = SnapshotRecorder::new(8);
        recorder.on_turn_ended(&snapshot());
        ControlHandle::new(sender, Arc::new(Mutex::new(recorder)))
    }

    #[test]
    fn status_reflects_latest_snapshot() {
        let handle = handle_with_snapshot();
        let status = handle.status().expect("status");
        assert_eq!(status.round, 2);
        assert_eq!(status.turn, 17);
        assert_eq!(status.alive, 2);
        assert_eq!(status.robots[0].state, "active");
        assert_eq!(status.robots[0].pending_events, 1);
    }

    #[test]
    fn status_json_carries_schema_fields() {
        let handle = handle_with_snapshot();
        let value = handle.status_json().expect("json");
        assert_eq!(value["turn"], 17);
        assert_eq!(value["robots"][1]["name"], "strong");
    }

    #[test]
    fn scoreboard_sorts_by_energy() {
        let handle = handle_with_snapshot();
        let board = handle.scoreboard().expect("scoreboard");
        assert_eq!(board[0].name, "strong");
        assert_eq!(board[1].name, "weak");
    }

    #[test]
    fn empty_recorder_reports_no_snapshot() {
        let (sender, _receiver) = create_command_bus(4);
        let handle = ControlHandle::new(sender, Arc::new(Mutex::new(SnapshotRecorder::new(8))));
        assert!(matches!(handle.status(), Err(ControlError::NoSnapshot)));
    }

    #[test]
    fn commands_enqueue_until_the_bus_fills() {
        let (sender, _receiver) = create_command_bus(1);
        let handle = ControlHandle::new(
            sender,
            Arc::new(Mutex::new(SnapshotRecorder::new(8))),
        );
        handle.pause().expect("first command fits");
        assert!(matches!(
            handle.resume(),
            Err(ControlError::CommandQueueFull)
        ));
    }
}
