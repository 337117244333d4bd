use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use ecosim_core::{
    Environment, EnvironmentConfig, Food, Genome, Organism, Position, SpatialStrategy,
};
use rand::{SeedableRng, rngs::SmallRng};
use std::time::Duration;

fn populated_environment(strategy: SpatialStrategy, organisms: usize) -> Environment {
    let mut env = Environment::new(EnvironmentConfig {
        width: 800.0,
        height: 800.0,
        spatial_strategy: strategy,
        rng_seed: Some(0xBEEF),
        history_capacity: 1,
        ..EnvironmentConfig::default()
    })
    .expect("environment");
    let mut rng = SmallRng::seed_from_u64(0xFEED);
    for i in 0..organisms {
        let position = Position::new((i * 97 % 800) as f32, (i * 211 % 800) as f32);
        env.add_organism(Organism::new(Genome::random(&mut rng)), position)
            .expect("organism");
    }
    for i in 0..organisms {
        let position = Position::new((i * 131 % 800) as f32, (i * 53 % 800) as f32);
        env.add_food(Food::default(), position).expect("food");
    }
    env
}

fn bench_environment_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("environment_step");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));
    let strategies = [
        ("naive", SpatialStrategy::Naive),
        ("partitioned", SpatialStrategy::Partitioned),
    ];
    for &(label, strategy) in &strategies {
        for &organisms in &[200_usize, 1_000] {
            group.bench_function(format!("{label}_organisms{organisms}"), |b| {
                b.iter_batched(
                    || populated_environment(strategy, organisms),
                    |mut env| {
                        for _ in 0..16 {
                            env.step().expect("step");
                        }
                    },
                    BatchSize::LargeInput,
                );
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_environment_step);
criterion_main!(benches);
