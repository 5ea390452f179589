//! Core types shared across the Steelbots workspace.
//!
//! Everything in this crate is single-threaded and deterministic: given the
//! same configuration, seed, and per-turn command sets, two battles produce
//! identical state and event sequences. The hosted-execution layer lives in
//! `steelbots-engine` and drives this model from the scheduler thread.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::{PI, TAU};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Starting energy for every robot at the beginning of a round.
pub const START_ENERGY: f64 = 100.0;
/// Top speed in arena units per turn.
pub const MAX_VELOCITY: f64 = 8.0;
/// Velocity gained per turn while accelerating toward a move order.
pub const ACCELERATION: f64 = 1.0;
/// Velocity shed per turn while braking.
pub const DECELERATION: f64 = 2.0;
/// Bounding radius of a robot body.
pub const ROBOT_RADIUS: f64 = 18.0;
/// Smallest fire power accepted by the gun.
pub const MIN_FIRE_POWER: f64 = 0.1;
/// Largest fire power accepted by the gun.
pub const MAX_FIRE_POWER: f64 = 3.0;
/// Maximum gun rotation per turn (20 degrees).
pub const GUN_TURN_RATE: f64 = PI / 9.0;
/// Maximum radar rotation per turn (45 degrees).
pub const RADAR_TURN_RATE: f64 = PI / 4.0;
/// Energy drained from both parties of a ramming collision.
pub const RAM_DAMAGE: f64 = 0.6;
/// Default priority assigned to custom events whose condition does not say otherwise.
pub const DEFAULT_CUSTOM_PRIORITY: i32 = 80;
/// Lowest priority a robot may assign to an ordinary event class.
pub const MIN_EVENT_PRIORITY: i32 = 0;
/// Highest priority a robot may assign to an ordinary event class.
pub const MAX_EVENT_PRIORITY: i32 = 99;
/// Reserved priority band for death notification.
pub const RESERVED_DEATH_PRIORITY: i32 = -1;
/// Reserved priority band for lifecycle and skipped-turn events.
pub const RESERVED_LIFECYCLE_PRIORITY: i32 = 100;
/// Queued ordinary events older than this many turns are pruned undelivered.
pub const MAX_EVENT_AGE: u64 = 2;

const EPS: f64 = 1e-9;

/// Maximum body rotation per turn, which shrinks with speed.
#[must_use]
pub fn max_body_turn_rate(velocity: f64) -> f64 {
    (10.0 - 0.75 * velocity.abs()).to_radians()
}

/// Muzzle velocity of a bullet fired with `power`.
#[must_use]
pub fn bullet_speed(power: f64) -> f64 {
    20.0 - 3.0 * power
}

/// Damage dealt by a bullet fired with `power`.
#[must_use]
pub fn bullet_damage(power: f64) -> f64 {
    4.0 * power + 2.0 * (power - 1.0).max(0.0)
}

/// Energy returned to the shooter when a bullet connects.
#[must_use]
pub fn fire_refund(power: f64) -> f64 {
    3.0 * power
}

/// Heat added to the gun by firing with `power`.
#[must_use]
pub fn gun_heat_generated(power: f64) -> f64 {
    1.0 + power / 5.0
}

/// Energy lost by driving into a wall at `velocity`.
#[must_use]
pub fn wall_damage(velocity: f64) -> f64 {
    (velocity.abs() * 0.5 - 1.0).max(0.0)
}

fn wrap_signed_angle(mut angle: f64) -> f64 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle <= -PI {
        angle += TAU;
    }
    while angle > PI {
        angle -= TAU;
    }
    angle
}

fn wrap_unsigned_angle(mut angle: f64) -> f64 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle < 0.0 {
        angle += TAU;
    }
    while angle >= TAU {
        angle -= TAU;
    }
    angle
}

/// Simulation turn counter. Resets to zero at every round start.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Turn(pub u64);

impl Turn {
    /// Turn zero, the state before any commands have been applied.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The turn that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while validating or applying battle configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid battle configuration: {0}")]
    Invalid(&'static str),
    #[error("a battle requires at least one robot")]
    NoRobots,
}

/// Battle-wide configuration. All knobs are plain data so external tooling
/// can serialize, diff, and patch them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleConfig {
    /// Arena width in world units.
    pub arena_width: f64,
    /// Arena height in world units.
    pub arena_height: f64,
    /// Number of rounds fought before the battle finishes.
    pub rounds: u32,
    /// Hard turn limit per round.
    pub max_turns: u64,
    /// Heat removed from every gun each turn.
    pub gun_cooling_rate: f64,
    /// Gun heat every robot starts a round with.
    pub round_start_gun_heat: f64,
    /// Per-robot CPU budget for producing one turn's commands.
    pub cpu_quota: Duration,
    /// Consecutive skipped turns after which a robot is removed from play.
    pub max_consecutive_skipped_turns: u32,
    /// Byte ceiling of each robot's private data area.
    pub data_quota_bytes: usize,
    /// Maximum distance at which the radar registers another robot.
    pub radar_scan_radius: f64,
    /// Number of turn snapshots retained by the bundled recorder.
    pub snapshot_history_capacity: usize,
    /// Optional RNG seed for reproducible starting placements.
    pub rng_seed: Option<u64>,
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            arena_width: 800.0,
            arena_height: 600.0,
            rounds: 10,
            max_turns: 5_000,
            gun_cooling_rate: 0.1,
            round_start_gun_heat: 3.0,
            cpu_quota: Duration::from_millis(10),
            max_consecutive_skipped_turns: 30,
            data_quota_bytes: 195_000,
            radar_scan_radius: 1_200.0,
            snapshot_history_capacity: 256,
            rng_seed: None,
        }
    }
}

impl BattleConfig {
    /// Validates the configuration before a battle may start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.arena_width.is_finite() || !self.arena_height.is_finite() {
            return Err(ConfigError::Invalid("arena dimensions must be finite"));
        }
        if self.arena_width < 4.0 * ROBOT_RADIUS || self.arena_height < 4.0 * ROBOT_RADIUS {
            return Err(ConfigError::Invalid(
                "arena must fit at least two robot diameters per axis",
            ));
        }
        if self.rounds == 0 {
            return Err(ConfigError::Invalid("rounds must be at least one"));
        }
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid("max_turns must be at least one"));
        }
        if !(self.gun_cooling_rate > 0.0) || !self.gun_cooling_rate.is_finite() {
            return Err(ConfigError::Invalid("gun_cooling_rate must be positive"));
        }
        if self.round_start_gun_heat < 0.0 || !self.round_start_gun_heat.is_finite() {
            return Err(ConfigError::Invalid(
                "round_start_gun_heat must be non-negative",
            ));
        }
        if self.cpu_quota.is_zero() {
            return Err(ConfigError::Invalid("cpu_quota must be non-zero"));
        }
        if self.max_consecutive_skipped_turns == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_skipped_turns must be at least one",
            ));
        }
        if !(self.radar_scan_radius > 0.0) || !self.radar_scan_radius.is_finite() {
            return Err(ConfigError::Invalid("radar_scan_radius must be positive"));
        }
        Ok(())
    }
}

/// Where a robot is in its lifecycle within the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RobotLifecycle {
    /// Fighting normally.
    #[default]
    Active,
    /// Out of energy from its own spending; unable to move or fire, but
    /// still a valid target.
    Disabled,
    /// Removed from play for the rest of the round.
    Dead,
}

impl RobotLifecycle {
    /// Whether the robot still occupies the arena.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::Dead)
    }
}

/// Per-robot mutable record, owned and mutated only by turn resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub x: f64,
    pub y: f64,
    pub body_heading: f64,
    pub gun_heading: f64,
    pub radar_heading: f64,
    pub velocity: f64,
    pub energy: f64,
    pub gun_heat: f64,
    pub distance_remaining: f64,
    pub body_turn_remaining: f64,
    pub gun_turn_remaining: f64,
    pub radar_turn_remaining: f64,
    pub lifecycle: RobotLifecycle,
    pub body_color: [f32; 3],
    pub gun_color: [f32; 3],
    pub radar_color: [f32; 3],
}

impl Default for RobotState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            body_heading: 0.0,
            gun_heading: 0.0,
            radar_heading: 0.0,
            velocity: 0.0,
            energy: START_ENERGY,
            gun_heat: 3.0,
            distance_remaining: 0.0,
            body_turn_remaining: 0.0,
            gun_turn_remaining: 0.0,
            radar_turn_remaining: 0.0,
            lifecycle: RobotLifecycle::Active,
            body_color: [0.3, 0.3, 0.3],
            gun_color: [0.3, 0.3, 0.3],
            radar_color: [0.3, 0.3, 0.3],
        }
    }
}

/// Read-only view of a robot's own state as of the last committed turn.
///
/// This is the only world information hosted code can query directly;
/// knowledge of opponents arrives through scan events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobotStatus {
    pub robot: usize,
    pub round: u32,
    pub turn: Turn,
    pub x: f64,
    pub y: f64,
    pub body_heading: f64,
    pub gun_heading: f64,
    pub radar_heading: f64,
    pub velocity: f64,
    pub energy: f64,
    pub gun_heat: f64,
    pub distance_remaining: f64,
    pub body_turn_remaining: f64,
    pub gun_turn_remaining: f64,
    pub radar_turn_remaining: f64,
    pub others_alive: u32,
    pub lifecycle: RobotLifecycle,
}

/// The command bundle a robot commits for one turn. Absent fields leave the
/// corresponding remaining amounts untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnCommands {
    pub move_distance: Option<f64>,
    pub body_turn: Option<f64>,
    pub gun_turn: Option<f64>,
    pub radar_turn: Option<f64>,
    pub fire_power: Option<f64>,
    pub body_color: Option<[f32; 3]>,
    pub gun_color: Option<[f32; 3]>,
    pub radar_color: Option<[f32; 3]>,
}

impl TurnCommands {
    /// Whether the bundle carries no instructions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Staging area for deferred commands between commits. Later writes to the
/// same field overwrite earlier ones; `take` flushes the bundle for commit.
#[derive(Debug, Default)]
pub struct PendingCommands {
    staged: TurnCommands,
}

impl PendingCommands {
    pub fn set_move(&mut self, distance: f64) {
        self.staged.move_distance = Some(distance);
    }

    pub fn set_turn_body(&mut self, angle: f64) {
        self.staged.body_turn = Some(angle);
    }

    pub fn set_turn_gun(&mut self, angle: f64) {
        self.staged.gun_turn = Some(angle);
    }

    pub fn set_turn_radar(&mut self, angle: f64) {
        self.staged.radar_turn = Some(angle);
    }

    pub fn set_fire(&mut self, power: f64) {
        self.staged.fire_power = Some(power);
    }

    pub fn set_body_color(&mut self, color: [f32; 3]) {
        self.staged.body_color = Some(color);
    }

    pub fn set_gun_color(&mut self, color: [f32; 3]) {
        self.staged.gun_color = Some(color);
    }

    pub fn set_radar_color(&mut self, color: [f32; 3]) {
        self.staged.radar_color = Some(color);
    }

    /// Current staged bundle.
    #[must_use]
    pub fn staged(&self) -> &TurnCommands {
        &self.staged
    }

    /// Flush the staged bundle, leaving the staging area empty.
    #[must_use]
    pub fn take(&mut self) -> TurnCommands {
        std::mem::take(&mut self.staged)
    }
}

/// A bullet in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bullet {
    pub id: u64,
    pub owner: usize,
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    pub power: f64,
}

/// Fieldless discriminant of an event, used for priority overrides and for
/// naming events in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Status,
    ScannedRobot,
    HitByBullet,
    BulletHit,
    BulletMissed,
    HitWall,
    HitRobot,
    RobotDeath,
    Message,
    Custom,
    Death,
    SkippedTurn,
    Win,
    RoundEnded,
}

impl EventClass {
    /// Stable textual name, accepted by the priority override surface.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::ScannedRobot => "scanned_robot",
            Self::HitByBullet => "hit_by_bullet",
            Self::BulletHit => "bullet_hit",
            Self::BulletMissed => "bullet_missed",
            Self::HitWall => "hit_wall",
            Self::HitRobot => "hit_robot",
            Self::RobotDeath => "robot_death",
            Self::Message => "message",
            Self::Custom => "custom",
            Self::Death => "death",
            Self::SkippedTurn => "skipped_turn",
            Self::Win => "win",
            Self::RoundEnded => "round_ended",
        }
    }

    /// Parse a class name as used by the peer surface.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "status" => Self::Status,
            "scanned_robot" => Self::ScannedRobot,
            "hit_by_bullet" => Self::HitByBullet,
            "bullet_hit" => Self::BulletHit,
            "bullet_missed" => Self::BulletMissed,
            "hit_wall" => Self::HitWall,
            "hit_robot" => Self::HitRobot,
            "robot_death" => Self::RobotDeath,
            "message" => Self::Message,
            "custom" => Self::Custom,
            "death" => Self::Death,
            "skipped_turn" => Self::SkippedTurn,
            "win" => Self::Win,
            "round_ended" => Self::RoundEnded,
            _ => return None,
        })
    }

    /// Delivery priority used when no override is registered.
    #[must_use]
    pub const fn default_priority(self) -> i32 {
        match self {
            Self::ScannedRobot => 10,
            Self::HitByBullet => 20,
            Self::HitWall => 30,
            Self::HitRobot => 40,
            Self::BulletHit => 50,
            Self::BulletMissed => 60,
            Self::RobotDeath => 70,
            Self::Message => 75,
            Self::Custom => DEFAULT_CUSTOM_PRIORITY,
            Self::Status => 99,
            Self::Death => RESERVED_DEATH_PRIORITY,
            Self::SkippedTurn | Self::Win | Self::RoundEnded => RESERVED_LIFECYCLE_PRIORITY,
        }
    }

    /// Reserved classes always outrank ordinary bands and reject overrides.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        matches!(
            self,
            Self::Death | Self::SkippedTurn | Self::Win | Self::RoundEnded
        )
    }
}

/// Typed occurrence delivered to a single robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// Per-turn heartbeat carrying no payload; robots read their status view.
    Status,
    ScannedRobot {
        robot: usize,
        name: String,
        bearing: f64,
        distance: f64,
        energy: f64,
        heading: f64,
        velocity: f64,
    },
    HitByBullet {
        shooter: usize,
        power: f64,
        bearing: f64,
    },
    BulletHit {
        bullet: u64,
        victim: usize,
        victim_energy: f64,
    },
    BulletMissed {
        bullet: u64,
    },
    HitWall {
        bearing: f64,
    },
    HitRobot {
        other: usize,
        bearing: f64,
        other_energy: f64,
        at_fault: bool,
    },
    RobotDeath {
        robot: usize,
    },
    Message {
        from: usize,
        payload: Vec<u8>,
    },
    Custom {
        name: String,
    },
    Death,
    SkippedTurn,
    Win,
    RoundEnded,
}

impl EventKind {
    /// Discriminant of this event.
    #[must_use]
    pub const fn class(&self) -> EventClass {
        match self {
            Self::Status => EventClass::Status,
            Self::ScannedRobot { .. } => EventClass::ScannedRobot,
            Self::HitByBullet { .. } => EventClass::HitByBullet,
            Self::BulletHit { .. } => EventClass::BulletHit,
            Self::BulletMissed { .. } => EventClass::BulletMissed,
            Self::HitWall { .. } => EventClass::HitWall,
            Self::HitRobot { .. } => EventClass::HitRobot,
            Self::RobotDeath { .. } => EventClass::RobotDeath,
            Self::Message { .. } => EventClass::Message,
            Self::Custom { .. } => EventClass::Custom,
            Self::Death => EventClass::Death,
            Self::SkippedTurn => EventClass::SkippedTurn,
            Self::Win => EventClass::Win,
            Self::RoundEnded => EventClass::RoundEnded,
        }
    }
}

/// An event queued for delivery, stamped with priority and creation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub priority: i32,
    pub turn: Turn,
    seq: u64,
}

/// Errors reported synchronously to the robot manipulating its event queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown event class: {0}")]
    UnknownEventClass(String),
    #[error("priority of reserved event class {0} cannot be changed")]
    ReservedEventClass(&'static str),
    #[error("event priority {requested} outside the ordinary band 0..=99")]
    PriorityOutOfRange { requested: i32 },
    #[error("a condition named {0} is already registered")]
    DuplicateCondition(String),
}

/// User-supplied predicate backing a custom event.
///
/// Conditions are evaluated once per turn against the owning robot's status
/// view. A satisfied condition fires exactly once; it must be removed and
/// registered again to rearm.
pub trait Condition: Send {
    /// Name of the custom event fired when the condition holds.
    fn name(&self) -> &str;

    /// Delivery priority of the fired event.
    fn priority(&self) -> i32 {
        DEFAULT_CUSTOM_PRIORITY
    }

    /// Evaluate the predicate against the robot's current view.
    fn test(&mut self, status: &RobotStatus) -> bool;
}

/// Closure-backed [`Condition`] for programs that do not need a named type.
pub struct FnCondition<F> {
    name: String,
    priority: i32,
    test: F,
}

impl<F> FnCondition<F>
where
    F: FnMut(&RobotStatus) -> bool + Send,
{
    pub fn new(name: impl Into<String>, priority: i32, test: F) -> Self {
        Self {
            name: name.into(),
            priority,
            test,
        }
    }
}

impl<F> Condition for FnCondition<F>
where
    F: FnMut(&RobotStatus) -> bool + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn test(&mut self, status: &RobotStatus) -> bool {
        (self.test)(status)
    }
}

struct RegisteredCondition {
    condition: Box<dyn Condition>,
    fired: bool,
}

/// Priority-ordered, interruptible event store for a single robot.
///
/// Delivery order is strictly descending priority; within a band the most
/// recently pushed event is delivered first.
#[derive(Default)]
pub struct EventQueue {
    events: Vec<Event>,
    next_seq: u64,
    overrides: HashMap<EventClass, i32>,
    conditions: Vec<RegisteredCondition>,
    interruptible: bool,
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("queued", &self.events.len())
            .field("conditions", &self.conditions.len())
            .field("interruptible", &self.interruptible)
            .finish()
    }
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event, resolving its priority from the class table.
    pub fn push(&mut self, kind: EventKind, turn: Turn) {
        let class = kind.class();
        let priority = if class.is_reserved() {
            class.default_priority()
        } else {
            self.overrides
                .get(&class)
                .copied()
                .unwrap_or_else(|| class.default_priority())
        };
        self.push_with_priority(kind, priority, turn);
    }

    fn push_with_priority(&mut self, kind: EventKind, priority: i32, turn: Turn) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(Event {
            kind,
            priority,
            turn,
            seq,
        });
    }

    /// Reference to the event that would be delivered next.
    #[must_use]
    pub fn peek_highest_priority(&self) -> Option<&Event> {
        self.events
            .iter()
            .max_by_key(|event| (event.priority, event.seq))
    }

    /// Remove and return the event that is next in delivery order.
    pub fn pop_delivered(&mut self) -> Option<Event> {
        let index = self
            .events
            .iter()
            .enumerate()
            .max_by_key(|(_, event)| (event.priority, event.seq))
            .map(|(index, _)| index)?;
        Some(self.events.swap_remove(index))
    }

    /// Whether a queued event would preempt a handler running at `floor`.
    #[must_use]
    pub fn has_priority_at_least(&self, floor: i32) -> bool {
        self.events.iter().any(|event| event.priority >= floor)
    }

    /// Whether an event at or above `floor` was pushed at or after the
    /// sequence watermark `since`.
    #[must_use]
    pub fn has_arrival_at_least(&self, floor: i32, since: u64) -> bool {
        self.events
            .iter()
            .any(|event| event.priority >= floor && event.seq >= since)
    }

    /// Sequence number the next pushed event will receive; used as an
    /// arrival watermark by the delivery layer.
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Remove and return the oldest queued event of `class`, if any.
    pub fn take_class(&mut self, class: EventClass) -> Option<Event> {
        let index = self
            .events
            .iter()
            .position(|event| event.kind.class() == class)?;
        Some(self.events.remove(index))
    }

    /// Drop every queued event.
    pub fn clear_all(&mut self) {
        self.events.clear();
    }

    /// Drop ordinary events that went undelivered for too long. Reserved
    /// events never expire.
    pub fn prune_stale(&mut self, now: Turn) {
        self.events.retain(|event| {
            event.kind.class().is_reserved() || event.turn.0 + MAX_EVENT_AGE >= now.0
        });
    }

    /// Register a condition; a second registration under the same name is
    /// rejected.
    pub fn register_condition(&mut self, condition: Box<dyn Condition>) -> Result<(), EventError> {
        let priority = condition.priority();
        if !(MIN_EVENT_PRIORITY..=MAX_EVENT_PRIORITY).contains(&priority) {
            return Err(EventError::PriorityOutOfRange {
                requested: priority,
            });
        }
        if self
            .conditions
            .iter()
            .any(|entry| entry.condition.name() == condition.name())
        {
            return Err(EventError::DuplicateCondition(condition.name().to_owned()));
        }
        self.conditions.push(RegisteredCondition {
            condition,
            fired: false,
        });
        Ok(())
    }

    /// Remove a registered condition by name, returning whether it existed.
    pub fn remove_condition(&mut self, name: &str) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|entry| entry.condition.name() != name);
        self.conditions.len() != before
    }

    /// Evaluate every armed condition against `status`, firing custom events
    /// for those that hold. Returns the number fired.
    pub fn evaluate_conditions(&mut self, status: &RobotStatus, turn: Turn) -> usize {
        let mut fired = Vec::new();
        for entry in &mut self.conditions {
            if entry.fired {
                continue;
            }
            if entry.condition.test(status) {
                entry.fired = true;
                fired.push((entry.condition.name().to_owned(), entry.condition.priority()));
            }
        }
        let count = fired.len();
        for (name, priority) in fired {
            self.push_with_priority(EventKind::Custom { name }, priority, turn);
        }
        count
    }

    /// Override the delivery priority of an ordinary event class.
    pub fn set_class_priority(&mut self, class_name: &str, priority: i32) -> Result<(), EventError> {
        let class = EventClass::from_name(class_name)
            .ok_or_else(|| EventError::UnknownEventClass(class_name.to_owned()))?;
        if class.is_reserved() {
            return Err(EventError::ReservedEventClass(class.name()));
        }
        if !(MIN_EVENT_PRIORITY..=MAX_EVENT_PRIORITY).contains(&priority) {
            return Err(EventError::PriorityOutOfRange {
                requested: priority,
            });
        }
        self.overrides.insert(class, priority);
        Ok(())
    }

    /// Current delivery priority of an event class.
    pub fn class_priority(&self, class_name: &str) -> Result<i32, EventError> {
        let class = EventClass::from_name(class_name)
            .ok_or_else(|| EventError::UnknownEventClass(class_name.to_owned()))?;
        Ok(self
            .overrides
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_priority()))
    }

    /// Set whether the currently running handler may be preempted by an
    /// equal-or-higher priority arrival.
    pub fn set_interruptible(&mut self, interruptible: bool) {
        self.interruptible = interruptible;
    }

    #[must_use]
    pub fn interruptible(&self) -> bool {
        self.interruptible
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate queued events in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

/// Storage-quota failure reported to the writing robot.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("data write of {requested} bytes exceeds remaining quota of {remaining} bytes")]
pub struct DataQuotaError {
    pub requested: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct QuotaLedger {
    consumed: Duration,
    skipped_streak: u32,
    data: Vec<u8>,
}

/// Per-robot CPU-time and storage quota bookkeeping.
///
/// The governor never reaches into hosted code; it only accounts for time
/// the scheduler observed and arbitrates writes to each robot's private data
/// area. Exceeding the CPU budget is signalled to the scheduler, which
/// records a skipped turn instead of failing the robot outright.
#[derive(Debug)]
pub struct ResourceGovernor {
    cpu_quota: Duration,
    data_quota: usize,
    ledgers: Vec<QuotaLedger>,
}

impl ResourceGovernor {
    #[must_use]
    pub fn new(robot_count: usize, cpu_quota: Duration, data_quota: usize) -> Self {
        let mut ledgers = Vec::with_capacity(robot_count);
        ledgers.resize_with(robot_count, QuotaLedger::default);
        Self {
            cpu_quota,
            data_quota,
            ledgers,
        }
    }

    /// Per-turn CPU budget.
    #[must_use]
    pub const fn cpu_quota(&self) -> Duration {
        self.cpu_quota
    }

    /// Reset per-round counters. Data areas persist across rounds.
    pub fn begin_round(&mut self) {
        for ledger in &mut self.ledgers {
            ledger.consumed = Duration::ZERO;
            ledger.skipped_streak = 0;
        }
    }

    /// Reset the CPU ledger for a new turn.
    pub fn begin_turn(&mut self, robot: usize) {
        self.ledgers[robot].consumed = Duration::ZERO;
    }

    /// Account observed CPU time against the robot's budget.
    pub fn charge_time(&mut self, robot: usize, elapsed: Duration) {
        self.ledgers[robot].consumed = self.ledgers[robot].consumed.saturating_add(elapsed);
    }

    /// CPU time consumed this turn.
    #[must_use]
    pub fn time_consumed(&self, robot: usize) -> Duration {
        self.ledgers[robot].consumed
    }

    /// Whether the robot still has budget left this turn.
    #[must_use]
    pub fn has_quota_remaining(&self, robot: usize) -> bool {
        self.ledgers[robot].consumed < self.cpu_quota
    }

    /// Record a missed commit window; returns the consecutive streak.
    pub fn record_skip(&mut self, robot: usize) -> u32 {
        self.ledgers[robot].skipped_streak += 1;
        self.ledgers[robot].skipped_streak
    }

    /// Record a successful commit, resetting the skip streak.
    pub fn record_commit(&mut self, robot: usize) {
        self.ledgers[robot].skipped_streak = 0;
    }

    #[must_use]
    pub fn skipped_streak(&self, robot: usize) -> u32 {
        self.ledgers[robot].skipped_streak
    }

    /// Append bytes to the robot's private data area. A write that would
    /// exceed the remaining quota fails atomically.
    pub fn write_data(&mut self, robot: usize, bytes: &[u8]) -> Result<(), DataQuotaError> {
        let ledger = &mut self.ledgers[robot];
        let remaining = self.data_quota.saturating_sub(ledger.data.len());
        if bytes.len() > remaining {
            return Err(DataQuotaError {
                requested: bytes.len(),
                remaining,
            });
        }
        ledger.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Bytes still available in the robot's data area.
    #[must_use]
    pub fn data_quota_remaining(&self, robot: usize) -> usize {
        self.data_quota
            .saturating_sub(self.ledgers[robot].data.len())
    }

    /// Contents of the robot's data area.
    #[must_use]
    pub fn data(&self, robot: usize) -> &[u8] {
        &self.ledgers[robot].data
    }

    /// Empty the robot's data area, returning its quota.
    pub fn clear_data(&mut self, robot: usize) {
        self.ledgers[robot].data.clear();
    }
}

/// Per-robot snapshot published after every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotSnapshot {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub body_heading: f64,
    pub gun_heading: f64,
    pub radar_heading: f64,
    pub velocity: f64,
    pub energy: f64,
    pub gun_heat: f64,
    pub state: RobotLifecycle,
    /// Class names of events queued but not yet delivered to this robot.
    pub pending_events: Vec<String>,
}

/// Immutable record of the battle after one committed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSnapshot {
    pub round: u32,
    pub turn: Turn,
    pub alive_count: u32,
    pub robots: Vec<RobotSnapshot>,
}

/// Everything turn resolution produced besides the state mutation itself.
#[derive(Debug, Clone, Default)]
pub struct TurnRecord {
    pub turn: Turn,
    /// Events addressed to individual robots, in deterministic generation order.
    pub events: Vec<(usize, EventKind)>,
    pub deaths: SmallVec<[usize; 4]>,
    pub bullets_fired: SmallVec<[u64; 4]>,
    pub alive: u32,
}

impl TurnRecord {
    fn new(turn: Turn) -> Self {
        Self {
            turn,
            ..Self::default()
        }
    }
}

/// External control instruction, applied at the next turn boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Pause,
    Resume,
    SingleStep,
    Stop,
    Kill { robot: usize },
    Restart,
    Replay,
}

/// Final standings of a finished battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleResult {
    pub names: Vec<String>,
    pub rounds_completed: u32,
    /// Rounds each robot ended as the sole survivor.
    pub wins: Vec<u32>,
    /// Total turns each robot stayed alive, summed over rounds.
    pub survived_turns: Vec<u64>,
    /// Seed the battle actually ran with; replaying it reproduces the battle.
    pub effective_seed: u64,
}

/// Observer of battle lifecycle and turn snapshots. Purely observational;
/// implementations get no way to mutate the battle.
pub trait BattleObserver: Send {
    fn on_battle_started(&mut self, _config: &BattleConfig, _names: &[String]) {}
    fn on_round_started(&mut self, _round: u32) {}
    fn on_turn_ended(&mut self, _snapshot: &TurnSnapshot) {}
    fn on_battle_paused(&mut self) {}
    fn on_battle_resumed(&mut self) {}
    fn on_battle_finished(&mut self, _result: &BattleResult) {}
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl BattleObserver for NullObserver {}

/// Bounded in-memory history of published snapshots.
#[derive(Debug)]
pub struct SnapshotRecorder {
    capacity: usize,
    history: VecDeque<TurnSnapshot>,
    result: Option<BattleResult>,
}

impl SnapshotRecorder {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history: VecDeque::with_capacity(capacity.max(1)),
            result: None,
        }
    }

    #[must_use]
    pub fn latest(&self) -> Option<&TurnSnapshot> {
        self.history.back()
    }

    pub fn history(&self) -> impl Iterator<Item = &TurnSnapshot> {
        self.history.iter()
    }

    #[must_use]
    pub fn result(&self) -> Option<&BattleResult> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

impl BattleObserver for SnapshotRecorder {
    fn on_turn_ended(&mut self, snapshot: &TurnSnapshot) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(snapshot.clone());
    }

    fn on_battle_finished(&mut self, result: &BattleResult) {
        self.result = Some(result.clone());
    }
}

/// Clonable handle sharing one [`SnapshotRecorder`] between the scheduler
/// and external readers.
#[derive(Clone)]
pub struct SharedRecorder {
    inner: Arc<Mutex<SnapshotRecorder>>,
}

impl SharedRecorder {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SnapshotRecorder::new(capacity))),
        }
    }

    /// Shared handle for readers outside the scheduler.
    #[must_use]
    pub fn handle(&self) -> Arc<Mutex<SnapshotRecorder>> {
        Arc::clone(&self.inner)
    }
}

impl BattleObserver for SharedRecorder {
    fn on_turn_ended(&mut self, snapshot: &TurnSnapshot) {
        if let Ok(mut recorder) = self.inner.lock() {
            recorder.on_turn_ended(snapshot);
        }
    }

    fn on_battle_finished(&mut self, result: &BattleResult) {
        if let Ok(mut recorder) = self.inner.lock() {
            recorder.on_battle_finished(result);
        }
    }
}

fn updated_velocity(velocity: f64, distance: f64) -> f64 {
    if distance.abs() <= EPS {
        return if velocity > 0.0 {
            (velocity - DECELERATION).max(0.0)
        } else {
            (velocity + DECELERATION).min(0.0)
        };
    }
    let sign = distance.signum();
    let speed = velocity * sign;
    let cap = decel_cap(distance);
    let new_speed = if speed < 0.0 {
        // Reversing out of motion opposite the order.
        (speed + DECELERATION).min(0.0)
    } else if speed <= cap {
        (speed + ACCELERATION).min(cap)
    } else {
        (speed - DECELERATION).max(cap)
    };
    new_speed * sign
}

/// Largest speed from which the robot can still brake to rest within
/// `distance`, clamped so short orders stop exactly on target.
fn decel_cap(distance: f64) -> f64 {
    let d = distance.abs();
    ((1.0 + 4.0 * d).sqrt() - 1.0).min(d).min(MAX_VELOCITY)
}

fn segment_circle_hit(
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
    cx: f64,
    cy: f64,
    radius: f64,
) -> Option<f64> {
    let dx = x1 - x0;
    let dy = y1 - y0;
    let fx = x0 - cx;
    let fy = y0 - cy;
    let a = dx * dx + dy * dy;
    let c = fx * fx + fy * fy - radius * radius;
    if c <= 0.0 {
        // Segment starts inside the circle.
        return Some(0.0);
    }
    if a <= EPS {
        return None;
    }
    let b = 2.0 * (fx * dx + fy * dy);
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / (2.0 * a);
    (0.0..=1.0).contains(&t).then_some(t)
}

/// Aggregate battle state: arena, roster, robots, and bullets in flight.
///
/// Exclusively owned and mutated by the scheduler; robots observe it only
/// through status views, events, and published snapshots.
pub struct BattleState {
    config: BattleConfig,
    names: Vec<String>,
    round: u32,
    turn: Turn,
    robots: Vec<RobotState>,
    bullets: Vec<Bullet>,
    next_bullet_id: u64,
    effective_seed: u64,
    rng: SmallRng,
}

impl fmt::Debug for BattleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BattleState")
            .field("round", &self.round)
            .field("turn", &self.turn)
            .field("robots", &self.robots.len())
            .field("bullets", &self.bullets.len())
            .finish()
    }
}

impl BattleState {
    /// Instantiate a battle from configuration and a robot roster.
    pub fn new(config: BattleConfig, names: Vec<String>) -> Result<Self, ConfigError> {
        config.validate()?;
        if names.is_empty() {
            return Err(ConfigError::NoRobots);
        }
        let effective_seed = config.rng_seed.unwrap_or_else(rand::random);
        let rng = SmallRng::seed_from_u64(effective_seed);
        let mut state = Self {
            robots: vec![RobotState::default(); names.len()],
            config,
            names,
            round: 0,
            turn: Turn::zero(),
            bullets: Vec::new(),
            next_bullet_id: 0,
            effective_seed,
            rng,
        };
        state.begin_round(0);
        Ok(state)
    }

    /// Reset per-round state and deal fresh starting placements.
    pub fn begin_round(&mut self, round: u32) {
        self.round = round;
        self.turn = Turn::zero();
        self.bullets.clear();
        let width = self.config.arena_width;
        let height = self.config.arena_height;
        for index in 0..self.robots.len() {
            let mut x = width * 0.5;
            let mut y = height * 0.5;
            // Rejection-sample a spot clear of earlier placements; bounded so
            // crowded arenas still terminate deterministically.
            for _ in 0..32 {
                x = self.rng.random_range(ROBOT_RADIUS..width - ROBOT_RADIUS);
                y = self.rng.random_range(ROBOT_RADIUS..height - ROBOT_RADIUS);
                let clear = self.robots[..index]
                    .iter()
                    .all(|other| (other.x - x).hypot(other.y - y) >= 4.0 * ROBOT_RADIUS);
                if clear {
                    break;
                }
            }
            let heading = self.rng.random_range(0.0..TAU);
            let robot = &mut self.robots[index];
            let colors = (robot.body_color, robot.gun_color, robot.radar_color);
            *robot = RobotState {
                x,
                y,
                body_heading: heading,
                gun_heading: heading,
                radar_heading: heading,
                gun_heat: self.config.round_start_gun_heat,
                body_color: colors.0,
                gun_color: colors.1,
                radar_color: colors.2,
                ..RobotState::default()
            };
        }
    }

    #[must_use]
    pub fn config(&self) -> &BattleConfig {
        &self.config
    }

    /// Seed the battle is actually running with.
    #[must_use]
    pub const fn effective_seed(&self) -> u64 {
        self.effective_seed
    }

    #[must_use]
    pub const fn round(&self) -> u32 {
        self.round
    }

    #[must_use]
    pub const fn turn(&self) -> Turn {
        self.turn
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn robots(&self) -> &[RobotState] {
        &self.robots
    }

    #[must_use]
    pub fn robot(&self, index: usize) -> &RobotState {
        &self.robots[index]
    }

    /// Mutable access to a robot slot (scheduler-side adjustments only).
    #[must_use]
    pub fn robot_mut(&mut self, index: usize) -> &mut RobotState {
        &mut self.robots[index]
    }

    #[must_use]
    pub fn bullets(&self) -> &[Bullet] {
        &self.bullets
    }

    #[must_use]
    pub fn alive_count(&self) -> u32 {
        self.robots
            .iter()
            .filter(|robot| robot.lifecycle.is_alive())
            .count() as u32
    }

    /// Status view of one robot as of the last committed turn.
    #[must_use]
    pub fn status_of(&self, index: usize) -> RobotStatus {
        let robot = &self.robots[index];
        let others_alive = self
            .robots
            .iter()
            .enumerate()
            .filter(|(other, state)| *other != index && state.lifecycle.is_alive())
            .count() as u32;
        RobotStatus {
            robot: index,
            round: self.round,
            turn: self.turn,
            x: robot.x,
            y: robot.y,
            body_heading: robot.body_heading,
            gun_heading: robot.gun_heading,
            radar_heading: robot.radar_heading,
            velocity: robot.velocity,
            energy: robot.energy,
            gun_heat: robot.gun_heat,
            distance_remaining: robot.distance_remaining,
            body_turn_remaining: robot.body_turn_remaining,
            gun_turn_remaining: robot.gun_turn_remaining,
            radar_turn_remaining: robot.radar_turn_remaining,
            others_alive,
            lifecycle: robot.lifecycle,
        }
    }

    /// Whether the round has reached a terminal condition.
    #[must_use]
    pub fn round_over(&self) -> bool {
        let alive = self.alive_count();
        if alive == 0 {
            return true;
        }
        if self.robots.len() > 1 && alive <= 1 {
            return true;
        }
        self.turn.0 >= self.config.max_turns
    }

    /// Remove a robot from play immediately, returning the resulting death
    /// events, or an empty list if it was already dead.
    pub fn kill(&mut self, index: usize) -> Vec<(usize, EventKind)> {
        if index >= self.robots.len() || !self.robots[index].lifecycle.is_alive() {
            return Vec::new();
        }
        let robot = &mut self.robots[index];
        robot.lifecycle = RobotLifecycle::Dead;
        robot.energy = 0.0;
        robot.velocity = 0.0;
        debug!(robot = index, "robot removed from play");
        let mut events = vec![(index, EventKind::Death)];
        for (other, state) in self.robots.iter().enumerate() {
            if other != index && state.lifecycle.is_alive() {
                events.push((other, EventKind::RobotDeath { robot: index }));
            }
        }
        events
    }

    /// Advance the battle by exactly one turn.
    ///
    /// `commands` holds one slot per robot; `None` means the robot missed
    /// this turn's commit window and its earlier orders simply continue.
    /// All stages iterate in ascending robot index so identical inputs
    /// always resolve identically.
    pub fn resolve_turn(&mut self, commands: &[Option<TurnCommands>]) -> TurnRecord {
        debug_assert_eq!(commands.len(), self.robots.len());
        let turn = self.turn.next();
        let mut record = TurnRecord::new(turn);
        let robot_count = self.robots.len();
        let mut damage_taken = vec![0.0_f64; robot_count];
        let mut fire_intent: Vec<Option<f64>> = vec![None; robot_count];

        // Stage 1: apply freshly committed command bundles.
        for (index, slot) in commands.iter().enumerate() {
            let Some(bundle) = slot else { continue };
            let robot = &mut self.robots[index];
            if robot.lifecycle != RobotLifecycle::Active {
                continue;
            }
            if let Some(distance) = bundle.move_distance {
                robot.distance_remaining = distance;
            }
            if let Some(angle) = bundle.body_turn {
                robot.body_turn_remaining = angle;
            }
            if let Some(angle) = bundle.gun_turn {
                robot.gun_turn_remaining = angle;
            }
            if let Some(angle) = bundle.radar_turn {
                robot.radar_turn_remaining = angle;
            }
            if let Some(color) = bundle.body_color {
                robot.body_color = color;
            }
            if let Some(color) = bundle.gun_color {
                robot.gun_color = color;
            }
            if let Some(color) = bundle.radar_color {
                robot.radar_color = color;
            }
            fire_intent[index] = bundle.fire_power;
        }

        // Stage 2: gun cooling, so a gun that reaches zero heat may fire now.
        for robot in &mut self.robots {
            if robot.lifecycle != RobotLifecycle::Dead {
                robot.gun_heat = (robot.gun_heat - self.config.gun_cooling_rate).max(0.0);
            }
        }

        // Stage 3: firing, with the pre-movement gun heading.
        for index in 0..robot_count {
            let Some(power) = fire_intent[index] else {
                continue;
            };
            let robot = &mut self.robots[index];
            if robot.lifecycle != RobotLifecycle::Active || robot.gun_heat > 0.0 {
                continue;
            }
            let power = power.clamp(MIN_FIRE_POWER, MAX_FIRE_POWER).min(robot.energy);
            if power < MIN_FIRE_POWER {
                continue;
            }
            robot.energy -= power;
            robot.gun_heat += gun_heat_generated(power);
            if robot.energy <= EPS {
                robot.energy = 0.0;
                robot.lifecycle = RobotLifecycle::Disabled;
            }
            let id = self.next_bullet_id;
            self.next_bullet_id += 1;
            self.bullets.push(Bullet {
                id,
                owner: index,
                x: robot.x + ROBOT_RADIUS * robot.gun_heading.cos(),
                y: robot.y + ROBOT_RADIUS * robot.gun_heading.sin(),
                heading: robot.gun_heading,
                power,
            });
            record.bullets_fired.push(id);
        }

        // Stage 4: rotation and translation. Radar headings before the sweep
        // are kept for scan-arc resolution below.
        let old_radar: Vec<f64> = self.robots.iter().map(|robot| robot.radar_heading).collect();
        for index in 0..robot_count {
            let arena_width = self.config.arena_width;
            let arena_height = self.config.arena_height;
            let robot = &mut self.robots[index];
            if robot.lifecycle == RobotLifecycle::Dead {
                continue;
            }
            let disabled = robot.lifecycle == RobotLifecycle::Disabled;

            let body_delta = if disabled {
                0.0
            } else {
                let rate = max_body_turn_rate(robot.velocity);
                robot.body_turn_remaining.clamp(-rate, rate)
            };
            robot.body_turn_remaining -= body_delta;
            robot.body_heading = wrap_unsigned_angle(robot.body_heading + body_delta);

            let gun_delta = if disabled {
                0.0
            } else {
                robot.gun_turn_remaining.clamp(-GUN_TURN_RATE, GUN_TURN_RATE)
            };
            robot.gun_turn_remaining -= gun_delta;
            robot.gun_heading = wrap_unsigned_angle(robot.gun_heading + body_delta + gun_delta);

            let radar_delta = if disabled {
                0.0
            } else {
                robot
                    .radar_turn_remaining
                    .clamp(-RADAR_TURN_RATE, RADAR_TURN_RATE)
            };
            robot.radar_turn_remaining -= radar_delta;
            robot.radar_heading =
                wrap_unsigned_angle(robot.radar_heading + body_delta + gun_delta + radar_delta);

            let order = if disabled { 0.0 } else { robot.distance_remaining };
            robot.velocity = updated_velocity(robot.velocity, order);
            robot.x += robot.velocity * robot.body_heading.cos();
            robot.y += robot.velocity * robot.body_heading.sin();
            if !disabled && robot.distance_remaining.abs() > EPS {
                let remaining = robot.distance_remaining - robot.velocity;
                robot.distance_remaining = if remaining.abs() <= EPS { 0.0 } else { remaining };
            }

            // Wall contact clamps position and kills momentum.
            let clamped_x = robot.x.clamp(ROBOT_RADIUS, arena_width - ROBOT_RADIUS);
            let clamped_y = robot.y.clamp(ROBOT_RADIUS, arena_height - ROBOT_RADIUS);
            if clamped_x != robot.x || clamped_y != robot.y {
                let wall_angle = if clamped_x != robot.x {
                    if robot.x < clamped_x { PI } else { 0.0 }
                } else if robot.y < clamped_y {
                    -PI / 2.0
                } else {
                    PI / 2.0
                };
                let damage = wall_damage(robot.velocity);
                robot.x = clamped_x;
                robot.y = clamped_y;
                robot.velocity = 0.0;
                robot.distance_remaining = 0.0;
                robot.energy -= damage;
                damage_taken[index] += damage;
                let bearing = wrap_signed_angle(wall_angle - robot.body_heading);
                record.events.push((index, EventKind::HitWall { bearing }));
            }
        }

        // Stage 5: robot-robot rams, ascending index pairs.
        for i in 0..robot_count {
            for j in (i + 1)..robot_count {
                if !self.robots[i].lifecycle.is_alive() || !self.robots[j].lifecycle.is_alive() {
                    continue;
                }
                let dx = self.robots[j].x - self.robots[i].x;
                let dy = self.robots[j].y - self.robots[i].y;
                let distance = dx.hypot(dy);
                if distance >= 2.0 * ROBOT_RADIUS {
                    continue;
                }
                let angle_ij = dy.atan2(dx);
                let fault = |robot: &RobotState, toward: f64| {
                    if robot.velocity.abs() <= EPS {
                        return false;
                    }
                    let travel = if robot.velocity >= 0.0 {
                        robot.body_heading
                    } else {
                        robot.body_heading + PI
                    };
                    wrap_signed_angle(toward - travel).abs() < PI / 2.0
                };
                let fault_i = fault(&self.robots[i], angle_ij);
                let fault_j = fault(&self.robots[j], angle_ij + PI);
                // Separate along the center line; degenerate overlap pushes
                // along the x axis.
                let (ux, uy) = if distance > EPS {
                    (dx / distance, dy / distance)
                } else {
                    (1.0, 0.0)
                };
                let push = (2.0 * ROBOT_RADIUS - distance) * 0.5 + EPS;
                let arena_width = self.config.arena_width;
                let arena_height = self.config.arena_height;
                for (index, direction) in [(i, -1.0), (j, 1.0)] {
                    let robot = &mut self.robots[index];
                    robot.x = (robot.x + direction * push * ux)
                        .clamp(ROBOT_RADIUS, arena_width - ROBOT_RADIUS);
                    robot.y = (robot.y + direction * push * uy)
                        .clamp(ROBOT_RADIUS, arena_height - ROBOT_RADIUS);
                    robot.velocity = 0.0;
                    robot.distance_remaining = 0.0;
                    robot.energy -= RAM_DAMAGE;
                    damage_taken[index] += RAM_DAMAGE;
                }
                let energy_i = self.robots[i].energy;
                let energy_j = self.robots[j].energy;
                record.events.push((
                    i,
                    EventKind::HitRobot {
                        other: j,
                        bearing: wrap_signed_angle(angle_ij - self.robots[i].body_heading),
                        other_energy: energy_j,
                        at_fault: fault_i,
                    },
                ));
                record.events.push((
                    j,
                    EventKind::HitRobot {
                        other: i,
                        bearing: wrap_signed_angle(angle_ij + PI - self.robots[j].body_heading),
                        other_energy: energy_i,
                        at_fault: fault_j,
                    },
                ));
            }
        }

        // Stage 6: bullet flight. Bullets advance in spawn order; the first
        // robot along the path (lowest index on exact ties) takes the hit.
        let bullets = std::mem::take(&mut self.bullets);
        for bullet in bullets {
            let speed = bullet_speed(bullet.power);
            let nx = bullet.x + speed * bullet.heading.cos();
            let ny = bullet.y + speed * bullet.heading.sin();
            let mut candidates: Vec<(OrderedFloat<f64>, usize)> = Vec::new();
            for (index, robot) in self.robots.iter().enumerate() {
                if index == bullet.owner || !robot.lifecycle.is_alive() {
                    continue;
                }
                if let Some(t) =
                    segment_circle_hit(bullet.x, bullet.y, nx, ny, robot.x, robot.y, ROBOT_RADIUS)
                {
                    candidates.push((OrderedFloat(t), index));
                }
            }
            candidates.sort_unstable();
            if let Some(&(_, victim)) = candidates.first() {
                let damage = bullet_damage(bullet.power);
                self.robots[victim].energy -= damage;
                damage_taken[victim] += damage;
                let victim_energy = self.robots[victim].energy.max(0.0);
                if self.robots[bullet.owner].lifecycle.is_alive() {
                    self.robots[bullet.owner].energy += fire_refund(bullet.power);
                }
                let bearing = wrap_signed_angle(
                    bullet.heading + PI - self.robots[victim].body_heading,
                );
                record.events.push((
                    bullet.owner,
                    EventKind::BulletHit {
                        bullet: bullet.id,
                        victim,
                        victim_energy,
                    },
                ));
                record.events.push((
                    victim,
                    EventKind::HitByBullet {
                        shooter: bullet.owner,
                        power: bullet.power,
                        bearing,
                    },
                ));
            } else if nx < 0.0
                || nx > self.config.arena_width
                || ny < 0.0
                || ny > self.config.arena_height
            {
                record
                    .events
                    .push((bullet.owner, EventKind::BulletMissed { bullet: bullet.id }));
            } else {
                self.bullets.push(Bullet {
                    x: nx,
                    y: ny,
                    ..bullet
                });
            }
        }

        // Stage 7: deaths. Only damage kills; running the gun dry merely
        // disables.
        let mut died: SmallVec<[usize; 4]> = SmallVec::new();
        for index in 0..robot_count {
            let robot = &mut self.robots[index];
            if robot.lifecycle == RobotLifecycle::Dead {
                continue;
            }
            if damage_taken[index] > 0.0 && robot.energy <= EPS {
                robot.lifecycle = RobotLifecycle::Dead;
                robot.energy = 0.0;
                robot.velocity = 0.0;
                died.push(index);
            }
        }
        for &victim in &died {
            debug!(robot = victim, turn = turn.0, "robot destroyed");
            record.events.push((victim, EventKind::Death));
            for (other, robot) in self.robots.iter().enumerate() {
                if other != victim && robot.lifecycle.is_alive() {
                    record
                        .events
                        .push((other, EventKind::RobotDeath { robot: victim }));
                }
            }
            record.deaths.push(victim);
        }

        // Stage 8: radar sweeps. A radar that did not move sees nothing.
        for index in 0..robot_count {
            if !self.robots[index].lifecycle.is_alive() {
                continue;
            }
            let sweep = wrap_signed_angle(self.robots[index].radar_heading - old_radar[index]);
            if sweep.abs() <= EPS {
                continue;
            }
            let (sx, sy) = (self.robots[index].x, self.robots[index].y);
            for (target, robot) in self.robots.iter().enumerate() {
                if target == index || !robot.lifecycle.is_alive() {
                    continue;
                }
                let dx = robot.x - sx;
                let dy = robot.y - sy;
                let distance = dx.hypot(dy);
                if distance > self.config.radar_scan_radius {
                    continue;
                }
                let rel = wrap_signed_angle(dy.atan2(dx) - old_radar[index]);
                let in_arc = if sweep >= 0.0 {
                    (0.0..=sweep).contains(&rel)
                } else {
                    (sweep..=0.0).contains(&rel)
                };
                if !in_arc {
                    continue;
                }
                let bearing =
                    wrap_signed_angle(dy.atan2(dx) - self.robots[index].body_heading);
                record.events.push((
                    index,
                    EventKind::ScannedRobot {
                        robot: target,
                        name: self.names[target].clone(),
                        bearing,
                        distance,
                        energy: robot.energy,
                        heading: robot.body_heading,
                        velocity: robot.velocity,
                    },
                ));
            }
        }

        // Stage 9: per-turn status heartbeat for the survivors.
        for (index, robot) in self.robots.iter().enumerate() {
            if robot.lifecycle.is_alive() {
                record.events.push((index, EventKind::Status));
            }
        }

        self.turn = turn;
        record.alive = self.alive_count();
        record
    }

    /// Immutable snapshot of the battle as of the last committed turn.
    /// `pending_events` is filled in by the publishing layer, which owns the
    /// event queues.
    #[must_use]
    pub fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot {
            round: self.round,
            turn: self.turn,
            alive_count: self.alive_count(),
            robots: self
                .robots
                .iter()
                .zip(&self.names)
                .map(|(robot, name)| RobotSnapshot {
                    name: name.clone(),
                    x: robot.x,
                    y: robot.y,
                    body_heading: robot.body_heading,
                    gun_heading: robot.gun_heading,
                    radar_heading: robot.radar_heading,
                    velocity: robot.velocity,
                    energy: robot.energy,
                    gun_heat: robot.gun_heat,
                    state: robot.lifecycle,
                    pending_events: Vec::new(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_robot_state(seed: u64) -> BattleState {
        let config = BattleConfig {
            rng_seed: Some(seed),
            ..BattleConfig::default()
        };
        BattleState::new(config, vec!["alpha".into(), "bravo".into()]).expect("state")
    }

    fn no_commands(state: &BattleState) -> Vec<Option<TurnCommands>> {
        vec![None; state.robots().len()]
    }

    #[test]
    fn config_rejects_degenerate_values() {
        let mut config = BattleConfig {
            arena_width: 10.0,
            ..BattleConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.arena_width = 800.0;
        config.rounds = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.rounds = 1;
        config.gun_cooling_rate = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn battle_requires_robots() {
        let err = BattleState::new(BattleConfig::default(), Vec::new()).unwrap_err();
        assert_eq!(err, ConfigError::NoRobots);
    }

    #[test]
    fn deferred_commands_are_last_write_wins() {
        let mut pending = PendingCommands::default();
        pending.set_move(50.0);
        pending.set_move(-100.0);
        let bundle = pending.take();
        assert_eq!(bundle.move_distance, Some(-100.0));
        assert!(pending.take().is_empty());
    }

    #[test]
    fn event_queue_orders_by_priority_then_recency() {
        let mut queue = EventQueue::new();
        let turn = Turn(1);
        queue.push_with_priority(EventKind::Custom { name: "low".into() }, 10, turn);
        queue.push_with_priority(EventKind::Custom { name: "first".into() }, 80, turn);
        queue.push_with_priority(EventKind::Custom { name: "second".into() }, 80, turn);
        queue.push_with_priority(EventKind::Custom { name: "high".into() }, 99, turn);

        let mut delivered = Vec::new();
        while let Some(event) = queue.pop_delivered() {
            if let EventKind::Custom { name } = event.kind {
                delivered.push(name);
            }
        }
        assert_eq!(delivered, ["high", "second", "first", "low"]);
    }

    #[test]
    fn reserved_events_outrank_ordinary_bands() {
        let mut queue = EventQueue::new();
        queue.push(EventKind::Status, Turn(1));
        queue.push(EventKind::SkippedTurn, Turn(1));
        let event = queue.pop_delivered().expect("event");
        assert_eq!(event.kind, EventKind::SkippedTurn);
        assert_eq!(event.priority, RESERVED_LIFECYCLE_PRIORITY);
    }

    #[test]
    fn class_priority_overrides_are_validated() {
        let mut queue = EventQueue::new();
        queue.set_class_priority("scanned_robot", 42).expect("override");
        assert_eq!(queue.class_priority("scanned_robot"), Ok(42));
        assert!(matches!(
            queue.set_class_priority("skipped_turn", 5),
            Err(EventError::ReservedEventClass(_))
        ));
        assert!(matches!(
            queue.set_class_priority("no_such_event", 5),
            Err(EventError::UnknownEventClass(_))
        ));
        assert!(matches!(
            queue.set_class_priority("status", 120),
            Err(EventError::PriorityOutOfRange { requested: 120 })
        ));
    }

    #[test]
    fn duplicate_conditions_are_rejected() {
        let mut queue = EventQueue::new();
        queue
            .register_condition(Box::new(FnCondition::new("low_energy", 80, |_| true)))
            .expect("register");
        let err = queue
            .register_condition(Box::new(FnCondition::new("low_energy", 80, |_| true)))
            .unwrap_err();
        assert_eq!(err, EventError::DuplicateCondition("low_energy".into()));
    }

    #[test]
    fn conditions_fire_once_until_rearmed() {
        let mut queue = EventQueue::new();
        queue
            .register_condition(Box::new(FnCondition::new("always", 80, |_| true)))
            .expect("register");
        let state = two_robot_state(7);
        let status = state.status_of(0);
        assert_eq!(queue.evaluate_conditions(&status, Turn(1)), 1);
        assert_eq!(queue.evaluate_conditions(&status, Turn(2)), 0);
        assert!(queue.remove_condition("always"));
        queue
            .register_condition(Box::new(FnCondition::new("always", 80, |_| true)))
            .expect("re-register");
        assert_eq!(queue.evaluate_conditions(&status, Turn(3)), 1);
    }

    #[test]
    fn stale_ordinary_events_are_pruned() {
        let mut queue = EventQueue::new();
        queue.push(EventKind::Status, Turn(1));
        queue.push(EventKind::Death, Turn(1));
        queue.prune_stale(Turn(10));
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.peek_highest_priority().map(|e| e.kind.class()),
            Some(EventClass::Death)
        );
    }

    #[test]
    fn governor_tracks_cpu_and_skip_streaks() {
        let mut governor = ResourceGovernor::new(2, Duration::from_millis(5), 64);
        governor.begin_turn(0);
        assert!(governor.has_quota_remaining(0));
        governor.charge_time(0, Duration::from_millis(6));
        assert!(!governor.has_quota_remaining(0));
        assert!(governor.has_quota_remaining(1));

        assert_eq!(governor.record_skip(0), 1);
        assert_eq!(governor.record_skip(0), 2);
        governor.record_commit(0);
        assert_eq!(governor.skipped_streak(0), 0);
    }

    #[test]
    fn data_writes_fail_atomically() {
        let mut governor = ResourceGovernor::new(1, Duration::from_millis(5), 16);
        governor.write_data(0, b"0123456789").expect("fits");
        let before = governor.data(0).to_vec();
        let err = governor.write_data(0, b"too many bytes!").unwrap_err();
        assert_eq!(err.requested, 15);
        assert_eq!(err.remaining, 6);
        assert_eq!(governor.data(0), before.as_slice());
        assert_eq!(governor.data_quota_remaining(0), 6);
    }

    #[test]
    fn firing_heats_gun_and_spawns_bullet() {
        let mut state = two_robot_state(11);
        {
            let robot = state.robot_mut(0);
            robot.x = 200.0;
            robot.y = 300.0;
            robot.body_heading = 0.0;
            robot.gun_heading = 0.0;
            robot.radar_heading = 0.0;
            robot.gun_heat = 0.1;
        }
        {
            let robot = state.robot_mut(1);
            robot.x = 600.0;
            robot.y = 500.0;
            robot.gun_heat = 0.1;
        }
        let before_b = state.robot(1).clone();

        let mut commands = no_commands(&state);
        commands[0] = Some(TurnCommands {
            fire_power: Some(3.0),
            ..TurnCommands::default()
        });
        let record = state.resolve_turn(&commands);

        assert_eq!(state.turn(), Turn(1));
        assert_eq!(record.bullets_fired.len(), 1);
        assert_eq!(state.bullets().len(), 1);
        let bullet = &state.bullets()[0];
        assert_eq!(bullet.owner, 0);
        assert!((bullet.power - 3.0).abs() < EPS);

        let shooter = state.robot(0);
        assert!((shooter.gun_heat - 1.6).abs() < EPS, "heat {}", shooter.gun_heat);
        assert!((shooter.energy - 97.0).abs() < EPS);

        let bystander = state.robot(1);
        assert_eq!(bystander.x, before_b.x);
        assert_eq!(bystander.y, before_b.y);
        assert_eq!(bystander.energy, before_b.energy);
        assert_eq!(bystander.velocity, before_b.velocity);
        assert!((bystander.gun_heat - 0.0).abs() < EPS);
    }

    #[test]
    fn hot_gun_refuses_to_fire() {
        let mut state = two_robot_state(11);
        assert!(state.robot(0).gun_heat > 0.0);
        let mut commands = no_commands(&state);
        commands[0] = Some(TurnCommands {
            fire_power: Some(2.0),
            ..TurnCommands::default()
        });
        let record = state.resolve_turn(&commands);
        assert!(record.bullets_fired.is_empty());
        assert!((state.robot(0).energy - START_ENERGY).abs() < EPS);
    }

    #[test]
    fn movement_accelerates_and_stops_on_target() {
        let config = BattleConfig {
            arena_width: 2_000.0,
            arena_height: 2_000.0,
            rng_seed: Some(3),
            ..BattleConfig::default()
        };
        let mut state = BattleState::new(config, vec!["solo".into()]).expect("state");
        {
            let robot = state.robot_mut(0);
            robot.x = 400.0;
            robot.y = 1_000.0;
            robot.body_heading = 0.0;
            robot.gun_heading = 0.0;
            robot.radar_heading = 0.0;
        }
        let mut commands = no_commands(&state);
        commands[0] = Some(TurnCommands {
            move_distance: Some(100.0),
            ..TurnCommands::default()
        });
        state.resolve_turn(&commands);
        assert!((state.robot(0).velocity - 1.0).abs() < EPS);
        assert!((state.robot(0).x - 401.0).abs() < EPS);

        let idle = no_commands(&state);
        for _ in 0..60 {
            state.resolve_turn(&idle);
        }
        let robot = state.robot(0);
        assert!(robot.velocity.abs() < EPS, "velocity {}", robot.velocity);
        assert!(robot.distance_remaining.abs() < EPS);
        assert!((robot.x - 500.0).abs() < 1.0, "x {}", robot.x);
    }

    #[test]
    fn velocity_never_exceeds_cap() {
        let config = BattleConfig {
            arena_width: 5_000.0,
            arena_height: 5_000.0,
            rng_seed: Some(3),
            ..BattleConfig::default()
        };
        let mut state = BattleState::new(config, vec!["solo".into()]).expect("state");
        {
            let robot = state.robot_mut(0);
            robot.x = 100.0;
            robot.y = 2_500.0;
            robot.body_heading = 0.0;
        }
        let mut commands = no_commands(&state);
        commands[0] = Some(TurnCommands {
            move_distance: Some(4_000.0),
            ..TurnCommands::default()
        });
        state.resolve_turn(&commands);
        let idle = no_commands(&state);
        for _ in 0..40 {
            state.resolve_turn(&idle);
            assert!(state.robot(0).velocity <= MAX_VELOCITY + EPS);
        }
        assert!((state.robot(0).velocity - MAX_VELOCITY).abs() < EPS);
    }

    #[test]
    fn wall_impact_stops_and_damages() {
        let mut state = two_robot_state(5);
        {
            let robot = state.robot_mut(0);
            robot.x = 778.0;
            robot.y = 300.0;
            robot.body_heading = 0.0;
            robot.velocity = 8.0;
            robot.distance_remaining = 100.0;
        }
        // Park the other robot far away so the stages cannot interact.
        {
            let robot = state.robot_mut(1);
            robot.x = ROBOT_RADIUS + 1.0;
            robot.y = ROBOT_RADIUS + 1.0;
        }
        let record = state.resolve_turn(&no_commands(&state));
        let robot = state.robot(0);
        assert!((robot.x - (800.0 - ROBOT_RADIUS)).abs() < EPS);
        assert_eq!(robot.velocity, 0.0);
        assert_eq!(robot.distance_remaining, 0.0);
        assert!((robot.energy - 97.0).abs() < EPS, "energy {}", robot.energy);
        assert!(record
            .events
            .iter()
            .any(|(index, kind)| *index == 0 && kind.class() == EventClass::HitWall));
    }

    #[test]
    fn overlapping_robots_ram_each_other() {
        let mut state = two_robot_state(5);
        {
            let robot = state.robot_mut(0);
            robot.x = 400.0;
            robot.y = 300.0;
        }
        {
            let robot = state.robot_mut(1);
            robot.x = 400.0 + ROBOT_RADIUS;
            robot.y = 300.0;
        }
        let record = state.resolve_turn(&no_commands(&state));
        assert!((state.robot(0).energy - (START_ENERGY - RAM_DAMAGE)).abs() < EPS);
        assert!((state.robot(1).energy - (START_ENERGY - RAM_DAMAGE)).abs() < EPS);
        let hit_events = record
            .events
            .iter()
            .filter(|(_, kind)| kind.class() == EventClass::HitRobot)
            .count();
        assert_eq!(hit_events, 2);
        let dx = state.robot(1).x - state.robot(0).x;
        assert!(dx >= 2.0 * ROBOT_RADIUS, "separation {dx}");
    }

    #[test]
    fn radar_sweep_scans_target_in_arc() {
        let mut state = two_robot_state(5);
        {
            let robot = state.robot_mut(0);
            robot.x = 200.0;
            robot.y = 300.0;
            robot.body_heading = 0.0;
            robot.gun_heading = 0.0;
            robot.radar_heading = wrap_unsigned_angle(-0.2);
        }
        {
            let robot = state.robot_mut(1);
            robot.x = 400.0;
            robot.y = 300.0;
        }
        let mut commands = no_commands(&state);
        commands[0] = Some(TurnCommands {
            radar_turn: Some(0.4),
            ..TurnCommands::default()
        });
        let record = state.resolve_turn(&commands);
        let scan = record
            .events
            .iter()
            .find_map(|(index, kind)| match kind {
                EventKind::ScannedRobot { robot, distance, .. } if *index == 0 => {
                    Some((*robot, *distance))
                }
                _ => None,
            })
            .expect("scan event");
        assert_eq!(scan.0, 1);
        assert!((scan.1 - 200.0).abs() < 1.0);
    }

    #[test]
    fn kill_emits_death_notifications() {
        let mut state = two_robot_state(9);
        let events = state.kill(1);
        assert!(events.contains(&(1, EventKind::Death)));
        assert!(events.contains(&(0, EventKind::RobotDeath { robot: 1 })));
        assert_eq!(state.alive_count(), 1);
        assert!(state.round_over());
        assert!(state.kill(1).is_empty());
    }

    #[test]
    fn turn_counter_is_monotonic_and_resets_per_round() {
        let mut state = two_robot_state(13);
        let idle = no_commands(&state);
        for expected in 1..=5 {
            let record = state.resolve_turn(&idle);
            assert_eq!(record.turn, Turn(expected));
            assert_eq!(state.turn(), Turn(expected));
        }
        state.begin_round(1);
        assert_eq!(state.round(), 1);
        assert_eq!(state.turn(), Turn::zero());
        assert!(state.bullets().is_empty());
        assert_eq!(state.robot(0).energy, START_ENERGY);
    }

    #[test]
    fn identical_seeds_resolve_identically() {
        let mut left = two_robot_state(0xDEAD_BEEF);
        let mut right = two_robot_state(0xDEAD_BEEF);
        let mut commands = no_commands(&left);
        commands[0] = Some(TurnCommands {
            move_distance: Some(120.0),
            body_turn: Some(1.0),
            ..TurnCommands::default()
        });
        commands[1] = Some(TurnCommands {
            fire_power: Some(2.0),
            radar_turn: Some(0.5),
            ..TurnCommands::default()
        });
        for _ in 0..32 {
            left.resolve_turn(&commands);
            right.resolve_turn(&commands);
        }
        assert_eq!(left.snapshot(), right.snapshot());
    }

    #[test]
    fn snapshot_carries_schema_fields() {
        let state = two_robot_state(21);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.round, 0);
        assert_eq!(snapshot.turn, Turn::zero());
        assert_eq!(snapshot.alive_count, 2);
        assert_eq!(snapshot.robots.len(), 2);
        assert_eq!(snapshot.robots[0].name, "alpha");
        assert!(snapshot.robots[0].pending_events.is_empty());
    }
}
