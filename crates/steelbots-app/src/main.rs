use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use steelbots_core::{BattleConfig, SharedRecorder};
use steelbots_engine::start_battle;
use tracing::info;

/// Headless Steelbots battle runner.
#[derive(Debug, Parser)]
#[command(name = "steelbots", about = "Run a deterministic robot battle in the terminal")]
struct Args {
    /// Robots to field, by catalog name; repeat the flag to add more.
    #[arg(long = "robot", default_values_t = ["spinner".to_owned(), "tracker".to_owned()])]
    robot: Vec<String>,

    /// Number of rounds to fight.
    #[arg(long, default_value_t = 3)]
    rounds: u32,

    /// Hard turn limit per round.
    #[arg(long, default_value_t = 5_000)]
    max_turns: u64,

    /// RNG seed for a reproducible battle.
    #[arg(long)]
    seed: Option<u64>,

    /// Per-robot CPU budget per turn, in milliseconds.
    #[arg(long, default_value_t = 10)]
    quota_ms: u64,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut roster = Vec::with_capacity(args.robot.len());
    for name in &args.robot {
        let spec = steelbots_robots::spec(name).with_context(|| {
            format!(
                "unknown robot {name:?}; available: {}",
                steelbots_robots::catalog().join(", "),
            )
        })?;
        roster.push(spec);
    }

    let config = BattleConfig {
        rounds: args.rounds,
        max_turns: args.max_turns,
        rng_seed: args.seed,
        cpu_quota: Duration::from_millis(args.quota_ms),
        ..BattleConfig::default()
    };
    let recorder = SharedRecorder::new(config.snapshot_history_capacity);
    let reader = recorder.handle();

    info!(robots = roster.len(), rounds = config.rounds, "starting battle");
    let handle = start_battle(config, roster, vec![Box::new(recorder)])?;
    let result = handle.wait()?;

    if let Ok(recorder) = reader.lock()
        && let Some(snapshot) = recorder.latest()
    {
        info!(
            round = snapshot.round,
            turn = snapshot.turn.0,
            alive = snapshot.alive_count,
            "final snapshot",
        );
    }

    println!(
        "battle finished after {} round(s), seed {}",
        result.rounds_completed, result.effective_seed,
    );
    let mut standings: Vec<usize> = (0..result.names.len()).collect();
    standings.sort_by(|&a, &b| {
        result.wins[b]
            .cmp(&result.wins[a])
            .then_with(|| result.survived_turns[b].cmp(&result.survived_turns[a]))
            .then_with(|| result.names[a].cmp(&result.names[b]))
    });
    for (rank, &index) in standings.iter().enumerate() {
        println!(
            "{:>2}. {:<12} wins {:>3}   survived {:>6} turns",
            rank + 1,
            result.names[index],
            result.wins[index],
            result.survived_turns[index],
        );
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
