use criterion::{Criterion, criterion_group, criterion_main};
use steelbots_core::{BattleConfig, BattleState, TurnCommands};

fn bench_resolve_turn(c: &mut Criterion) {
    let config = BattleConfig {
        arena_width: 2_000.0,
        arena_height: 2_000.0,
        max_turns: u64::MAX,
        rng_seed: Some(42),
        ..BattleConfig::default()
    };
    let names = (0..8).map(|i| format!("robot-{i}")).collect();
    let mut state = BattleState::new(config, names).expect("state");
    let commands: Vec<Option<TurnCommands>> = (0..8)
        .map(|i| {
            Some(TurnCommands {
                move_distance: Some(150.0 + i as f64 * 40.0),
                body_turn: Some(0.3),
                radar_turn: Some(0.7),
                fire_power: Some(1.0),
                ..TurnCommands::default()
            })
        })
        .collect();

    c.bench_function("resolve_turn_8_robots", |b| {
        b.iter(|| state.resolve_turn(&commands))
    });
}

criterion_group!(benches, bench_resolve_turn);
criterion_main!(benches);
