use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use steelbots_core::{
    BattleConfig, BattleObserver, ControlCommand, Event, EventKind, FnCondition, SharedRecorder,
    SnapshotRecorder, TurnSnapshot,
};
use steelbots_engine::{
    Capability, CommandSender, Peer, Robot, RobotError, RobotSpec, start_battle,
};

fn test_config(max_turns: u64, seed: u64) -> BattleConfig {
    BattleConfig {
        rounds: 1,
        max_turns,
        cpu_quota: Duration::from_secs(5),
        rng_seed: Some(seed),
        ..BattleConfig::default()
    }
}

fn history(recorder: &Arc<Mutex<SnapshotRecorder>>) -> Vec<TurnSnapshot> {
    recorder
        .lock()
        .expect("recorder")
        .history()
        .cloned()
        .collect()
}

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

struct Passive;

impl Robot for Passive {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        loop {
            peer.do_nothing(self)?;
        }
    }
}

fn passive_spec(name: &str) -> RobotSpec {
    RobotSpec::new(name, Capability::Junior, || Box::new(Passive))
}

#[test]
fn turns_advance_monotonically_and_battle_completes() {
    let recorder = SharedRecorder::new(64);
    let reader = recorder.handle();
    let handle = start_battle(
        test_config(10, 41),
        vec![passive_spec("alpha"), passive_spec("bravo")],
        vec![Box::new(recorder)],
    )
    .expect("battle starts");
    let result = handle.wait().expect("battle finishes");

    assert_eq!(result.rounds_completed, 1);
    let snapshots = history(&reader);
    assert_eq!(snapshots.len(), 10);
    for (offset, snapshot) in snapshots.iter().enumerate() {
        assert_eq!(snapshot.turn.0, offset as u64 + 1);
        assert_eq!(snapshot.round, 0);
        assert_eq!(snapshot.alive_count, 2);
    }
}

#[test]
fn deferred_commands_are_last_write_wins_through_the_peer() {
    struct LastWrite;
    impl Robot for LastWrite {
        fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
            peer.set_move(50.0)?;
            peer.set_move(-100.0)?;
            loop {
                peer.execute(self)?;
            }
        }
    }

    let recorder = SharedRecorder::new(8);
    let reader = recorder.handle();
    let handle = start_battle(
        test_config(2, 42),
        vec![RobotSpec::new("writer", Capability::Advanced, || {
            Box::new(LastWrite)
        })],
        vec![Box::new(recorder)],
    )
    .expect("battle starts");
    handle.wait().expect("battle finishes");

    let snapshots = history(&reader);
    // Velocity after the first turn carries the sign of the winning write.
    assert_eq!(snapshots[0].robots[0].velocity, -1.0);
}

#[test]
fn fire_scenario_heats_gun_and_leaves_bystander_untouched() {
    struct FireOnce;
    impl Robot for FireOnce {
        fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
            peer.set_fire(3.0)?;
            loop {
                peer.execute(self)?;
            }
        }
    }

    let config = BattleConfig {
        round_start_gun_heat: 0.0,
        ..test_config(2, 43)
    };
    let recorder = SharedRecorder::new(8);
    let reader = recorder.handle();
    let handle = start_battle(
        config,
        vec![
            RobotSpec::new("gunner", Capability::Advanced, || Box::new(FireOnce)),
            passive_spec("bystander"),
        ],
        vec![Box::new(recorder)],
    )
    .expect("battle starts");
    handle.wait().expect("battle finishes");

    let snapshots = history(&reader);
    let first = &snapshots[0];
    assert_eq!(first.turn.0, 1);
    assert!((first.robots[0].gun_heat - 1.6).abs() < 1e-9);
    assert!((first.robots[0].energy - 97.0).abs() < 1e-9);
    assert_eq!(first.robots[1].energy, 100.0);
    assert_eq!(first.alive_count, 2);
    assert_eq!(snapshots[1].turn.0, 2);
}

#[test]
fn quota_overrun_skips_only_the_offending_robot() {
    struct Sleeper;
    impl Robot for Sleeper {
        fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
            loop {
                std::thread::sleep(Duration::from_millis(250));
                peer.do_nothing(self)?;
            }
        }
    }

    let config = BattleConfig {
        cpu_quota: Duration::from_millis(50),
        ..test_config(3, 44)
    };
    let recorder = SharedRecorder::new(16);
    let reader = recorder.handle();
    let handle = start_battle(
        config,
        vec![
            RobotSpec::new("sleeper", Capability::Junior, || Box::new(Sleeper)),
            passive_spec("prompt"),
        ],
        vec![Box::new(recorder)],
    )
    .expect("battle starts");
    let result = handle.wait().expect("battle finishes");

    assert_eq!(result.rounds_completed, 1);
    let snapshots = history(&reader);
    assert_eq!(snapshots.len(), 3);
    let sleeper_skipped = snapshots.iter().any(|snapshot| {
        snapshot.robots[0]
            .pending_events
            .iter()
            .any(|name| name == "skipped_turn")
    });
    assert!(sleeper_skipped, "sleeper never flagged as skipped");
    for snapshot in &snapshots {
        assert!(
            !snapshot.robots[1]
                .pending_events
                .iter()
                .any(|name| name == "skipped_turn"),
            "prompt robot was skipped at turn {}",
            snapshot.turn,
        );
        assert_eq!(snapshot.alive_count, 2);
    }
}

struct Probe {
    log: Arc<Mutex<Vec<&'static str>>>,
    interruptible: bool,
    entries: usize,
}

impl Robot for Probe {
    fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
        peer.add_custom_event(Box::new(FnCondition::new("probe", 80, |_| true)))?;
        loop {
            peer.execute(self)?;
        }
    }

    fn on_event(&mut self, event: &Event, peer: &mut Peer) -> Result<(), RobotError> {
        if let EventKind::Custom { name } = &event.kind
            && name == "probe"
        {
            self.entries += 1;
            self.log.lock().expect("log").push("enter");
            if self.entries == 1 {
                peer.set_interruptible(self.interruptible)?;
                // Rearm so a second probe event arrives while this handler
                // is still suspended inside execute.
                peer.remove_custom_event("probe")?;
                peer.add_custom_event(Box::new(FnCondition::new("probe", 80, |_| true)))?;
                peer.execute(self)?;
            }
            self.log.lock().expect("log").push("complete");
        }
        Ok(())
    }
}

fn run_probe(interruptible: bool) -> Vec<&'static str> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let program_log = Arc::clone(&log);
    let handle = start_battle(
        test_config(12, 45),
        vec![RobotSpec::new("probe", Capability::Advanced, move || {
            Box::new(Probe {
                log: Arc::clone(&program_log),
                interruptible,
                entries: 0,
            })
        })],
        Vec::new(),
    )
    .expect("battle starts");
    handle.wait().expect("battle finishes");
    let entries = log.lock().expect("log").clone();
    entries
}

#[test]
fn interruptible_handler_is_abandoned_by_equal_priority_arrival() {
    assert_eq!(run_probe(true), vec!["enter", "enter", "complete"]);
}

#[test]
fn non_interruptible_handler_runs_to_completion() {
    assert_eq!(
        run_probe(false),
        vec!["enter", "complete", "enter", "complete"]
    );
}

#[test]
fn identical_configurations_replay_identically() {
    struct Dancer;
    impl Robot for Dancer {
        fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
            loop {
                peer.ahead(self, 60.0)?;
                peer.turn_body(self, 1.0)?;
                peer.turn_gun(self, -0.5)?;
                peer.turn_radar(self, 0.8)?;
                if peer.gun_heat() <= 0.0 {
                    peer.fire(self, 2.0)?;
                }
            }
        }
    }

    let run_once = || {
        let recorder = SharedRecorder::new(256);
        let reader = recorder.handle();
        let handle = start_battle(
            test_config(40, 77),
            vec![
                RobotSpec::new("lead", Capability::Standard, || Box::new(Dancer)),
                RobotSpec::new("follow", Capability::Standard, || Box::new(Dancer)),
            ],
            vec![Box::new(recorder)],
        )
        .expect("battle starts");
        handle.wait().expect("battle finishes");
        history(&reader)
    };

    let first = run_once();
    let second = run_once();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[derive(Default)]
struct GateProbe {
    paused: Arc<AtomicBool>,
    resumed: Arc<AtomicBool>,
}

impl BattleObserver for GateProbe {
    fn on_battle_paused(&mut self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn on_battle_resumed(&mut self) {
        self.resumed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn pause_gate_holds_turns_and_single_step_advances_one() {
    let recorder = SharedRecorder::new(8);
    let reader = recorder.handle();
    let gate = GateProbe::default();
    let paused = Arc::clone(&gate.paused);
    let resumed = Arc::clone(&gate.resumed);
    let handle = start_battle(
        test_config(100_000, 46),
        vec![passive_spec("alpha"), passive_spec("bravo")],
        vec![Box::new(recorder), Box::new(gate)],
    )
    .expect("battle starts");

    handle.pause().expect("pause");
    assert!(wait_until(
        || paused.load(Ordering::SeqCst),
        Duration::from_secs(5),
    ));

    let latest = |reader: &Arc<Mutex<SnapshotRecorder>>| {
        reader
            .lock()
            .expect("recorder")
            .latest()
            .map(|snapshot| snapshot.turn.0)
            .unwrap_or(0)
    };
    let held = latest(&reader);
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(latest(&reader), held, "turns advanced while paused");

    handle.single_step().expect("single step");
    assert!(wait_until(
        || latest(&reader) == held + 1,
        Duration::from_secs(5),
    ));
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(latest(&reader), held + 1, "single step ran more than one turn");

    handle.resume().expect("resume");
    assert!(wait_until(
        || latest(&reader) > held + 1,
        Duration::from_secs(5),
    ));
    assert!(resumed.load(Ordering::SeqCst));

    handle.stop().expect("stop");
    let result = handle.wait().expect("battle finishes");
    assert_eq!(result.rounds_completed, 0);
}

struct KillAt {
    turn: u64,
    sender: Arc<Mutex<Option<CommandSender>>>,
    sent: bool,
}

impl BattleObserver for KillAt {
    fn on_turn_ended(&mut self, snapshot: &TurnSnapshot) {
        if self.sent || snapshot.turn.0 < self.turn {
            return;
        }
        if let Some(sender) = self.sender.lock().expect("sender").as_ref() {
            let _ = sender.try_send(ControlCommand::Kill { robot: 1 });
            self.sent = true;
        }
    }
}

#[test]
fn kill_command_ends_the_round_for_the_survivor() {
    let sender_slot = Arc::new(Mutex::new(None));
    let observer = KillAt {
        turn: 3,
        sender: Arc::clone(&sender_slot),
        sent: false,
    };
    let handle = start_battle(
        test_config(200_000, 47),
        vec![passive_spec("alpha"), passive_spec("bravo")],
        vec![Box::new(observer)],
    )
    .expect("battle starts");
    *sender_slot.lock().expect("sender") = Some(handle.controls());

    let result = handle.wait().expect("battle finishes");
    assert_eq!(result.rounds_completed, 1);
    assert_eq!(result.wins, vec![1, 0]);
}

#[test]
fn data_quota_rejects_writes_atomically_through_the_peer() {
    struct DataWriter {
        log: Arc<Mutex<Vec<String>>>,
    }
    impl Robot for DataWriter {
        fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
            peer.write_data(b"0123456789")?;
            match peer.write_data(b"0123456789") {
                Err(RobotError::DataQuota(err)) => {
                    self.log
                        .lock()
                        .expect("log")
                        .push(format!("rejected:{}:{}", err.requested, err.remaining));
                }
                other => {
                    self.log
                        .lock()
                        .expect("log")
                        .push(format!("unexpected:{other:?}"));
                }
            }
            self.log
                .lock()
                .expect("log")
                .push(format!("len:{}", peer.data()?.len()));
            peer.write_data(b"abc")?;
            self.log
                .lock()
                .expect("log")
                .push(format!("remaining:{}", peer.data_quota_remaining()?));
            loop {
                peer.execute(self)?;
            }
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let program_log = Arc::clone(&log);
    let config = BattleConfig {
        data_quota_bytes: 16,
        ..test_config(3, 48)
    };
    let handle = start_battle(
        config,
        vec![RobotSpec::new("writer", Capability::Advanced, move || {
            Box::new(DataWriter {
                log: Arc::clone(&program_log),
            })
        })],
        Vec::new(),
    )
    .expect("battle starts");
    handle.wait().expect("battle finishes");

    let entries = log.lock().expect("log").clone();
    assert_eq!(entries, vec!["rejected:10:6", "len:10", "remaining:3"]);
}

#[test]
fn hosted_panic_kills_only_the_offending_robot() {
    struct Panicker;
    impl Robot for Panicker {
        fn run(&mut self, _peer: &mut Peer) -> Result<(), RobotError> {
            panic!("deliberate test panic");
        }
    }

    let config = BattleConfig {
        cpu_quota: Duration::from_millis(20),
        ..test_config(200_000, 49)
    };
    let handle = start_battle(
        config,
        vec![
            RobotSpec::new("panicker", Capability::Junior, || Box::new(Panicker)),
            passive_spec("survivor"),
        ],
        Vec::new(),
    )
    .expect("battle starts");
    let result = handle.wait().expect("battle finishes");

    assert_eq!(result.rounds_completed, 1);
    assert_eq!(result.wins, vec![0, 1]);
}

#[test]
fn team_messages_reach_teammates_next_drain() {
    struct Caller;
    impl Robot for Caller {
        fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
            peer.broadcast(&[7])?;
            loop {
                peer.execute(self)?;
            }
        }
    }

    struct Listener {
        log: Arc<Mutex<Vec<u8>>>,
    }
    impl Robot for Listener {
        fn run(&mut self, peer: &mut Peer) -> Result<(), RobotError> {
            loop {
                peer.execute(self)?;
            }
        }
        fn on_event(&mut self, event: &Event, _peer: &mut Peer) -> Result<(), RobotError> {
            if let EventKind::Message { payload, .. } = &event.kind {
                self.log.lock().expect("log").extend_from_slice(payload);
            }
            Ok(())
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let listener_log = Arc::clone(&log);
    let handle = start_battle(
        test_config(5, 50),
        vec![
            RobotSpec::new("caller", Capability::Team, || Box::new(Caller)).with_team("pair"),
            RobotSpec::new("listener", Capability::Team, move || {
                Box::new(Listener {
                    log: Arc::clone(&listener_log),
                })
            })
            .with_team("pair"),
        ],
        Vec::new(),
    )
    .expect("battle starts");
    handle.wait().expect("battle finishes");

    assert_eq!(log.lock().expect("log").as_slice(), &[7]);
}

#[test]
fn configuration_errors_surface_before_the_battle_starts() {
    let bad_config = BattleConfig {
        rounds: 0,
        ..BattleConfig::default()
    };
    assert!(start_battle(bad_config, vec![passive_spec("solo")], Vec::new()).is_err());
    assert!(start_battle(BattleConfig::default(), Vec::new(), Vec::new()).is_err());
}
