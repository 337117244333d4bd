use ecosim_core::{
    Environment, EnvironmentConfig, Food, Genome, Organism, Position, SpatialStrategy, strategies,
};

#[test]
fn stationary_pair_holds_distance_under_zero_cost() {
    let mut env = Environment::new(EnvironmentConfig {
        worker_count: 1,
        rng_seed: Some(5),
        ..EnvironmentConfig::default()
    })
    .expect("environment");

    let zero_cost = strategies::fixed_decay(0.0);
    let a = env
        .add_organism(
            Organism::new(Genome::default()).with_life_cost(zero_cost.clone()),
            Position::new(100.0, 100.0),
        )
        .expect("organism a");
    let b = env
        .add_organism(
            Organism::new(Genome::default()).with_life_cost(zero_cost),
            Position::new(120.0, 120.0),
        )
        .expect("organism b");
    let initial = Position::new(100.0, 100.0).distance_to(Position::new(120.0, 120.0));

    env.simulate_iteration(100).expect("run");

    assert_eq!(env.organism_count(), 2);
    let snapshot_a = env.organism(a).expect("a resident");
    let snapshot_b = env.organism(b).expect("b resident");
    let final_distance = snapshot_a.position.distance_to(snapshot_b.position);
    assert!(
        (final_distance - initial).abs() < 1e-4,
        "pair drifted: initial={initial}, final={final_distance}"
    );
    assert!((snapshot_a.life_span - 500.0).abs() < 1e-4);
    assert!((snapshot_b.life_span - 500.0).abs() < 1e-4);
}

#[test]
fn lone_grazer_clears_a_food_ring() {
    let mut env = Environment::new(EnvironmentConfig {
        spatial_strategy: SpatialStrategy::Partitioned,
        reproduction_threshold: 1e9,
        rng_seed: Some(21),
        ..EnvironmentConfig::default()
    })
    .expect("environment");

    // speed 30, size 40, awareness ~64: the ring stays in perception range
    // while the grazer sweeps it.
    env.add_organism(
        Organism::new(Genome::new([120, 160, 255, 0])),
        Position::new(500.0, 500.0),
    )
    .expect("grazer");
    for i in 0..80 {
        let angle = i as f32 * std::f32::consts::TAU / 80.0;
        let position = Position::new(500.0 + 80.0 * angle.cos(), 500.0 + 80.0 * angle.sin());
        env.add_food(Food::default(), position).expect("food");
    }

    env.simulate_iteration(300).expect("run");

    assert_eq!(env.food_count(), 0, "every pellet is consumed within the run");
    assert_eq!(env.food_consumed_this_run(), 80);
    let organisms = env.all_organisms();
    assert_eq!(organisms.len(), 1);
    assert!(organisms[0].alive);
    assert!(
        organisms[0].life_span > 500.0,
        "consumed energy outweighs upkeep, got {}",
        organisms[0].life_span
    );
}

#[test]
fn mixed_population_keeps_counters_consistent() {
    let mut env = Environment::new(EnvironmentConfig {
        worker_count: 2,
        rng_seed: Some(77),
        ..EnvironmentConfig::default()
    })
    .expect("environment");

    for i in 0..15 {
        let organism = Organism::new(Genome::new([60, 15, 80, 0]))
            .with_reaction(strategies::flee_then_eat(1.5));
        let position = Position::new(
            100.0 + 50.0 * (i % 5) as f32,
            100.0 + 60.0 * (i / 5) as f32,
        );
        env.add_organism(organism, position).expect("fleeing organism");
    }
    for i in 0..5 {
        let organism = Organism::new(Genome::new([30, 80, 60, 0]))
            .with_reaction(strategies::chase_prey(1.5))
            .with_interaction(strategies::predation(1.5));
        env.add_organism(organism, Position::new(150.0 + 120.0 * i as f32, 400.0))
            .expect("chasing organism");
    }
    for i in 0..30 {
        env.add_food(Food::default(), Position::new(80.0 + 28.0 * i as f32, 250.0))
            .expect("food");
    }

    let width = env.config().width;
    let height = env.config().height;
    let mut last_food_count = 30;
    env.simulate_iteration_with(200, |world| {
        let summary = world.history().back().copied().expect("summary");
        assert!(
            summary.food_count <= last_food_count,
            "food never respawns, tick {}",
            summary.tick
        );
        last_food_count = summary.food_count;
        assert_eq!(summary.organism_count, world.organism_count());
        for organism in world.all_organisms() {
            assert!(organism.position.x >= 0.0 && organism.position.x < width);
            assert!(organism.position.y >= 0.0 && organism.position.y < height);
        }
    })
    .expect("run");

    let total_births: usize = env.history().iter().map(|s| s.births).sum();
    let total_deaths: usize = env.history().iter().map(|s| s.deaths).sum();
    let total_eaten: usize = env.history().iter().map(|s| s.food_eaten).sum();
    assert!(total_eaten <= 30);
    assert_eq!(env.food_count(), 30 - total_eaten);
    assert_eq!(env.organism_count(), 20 + total_births - total_deaths);
    assert_eq!(env.food_consumed_this_run(), total_eaten);

    let dead = env.dead_organisms();
    assert_eq!(dead.len(), total_deaths);
    assert!(dead.iter().all(|organism| !organism.alive));
}

#[test]
fn seeded_full_runs_are_identical() {
    let build = || {
        let mut env = Environment::new(EnvironmentConfig {
            width: 600.0,
            height: 600.0,
            worker_count: 1,
            rng_seed: Some(99),
            ..EnvironmentConfig::default()
        })
        .expect("environment");
        for i in 0..8 {
            let organism = Organism::new(Genome::new([60, 15, 80, 0]))
                .with_reaction(strategies::flee_then_eat(1.5))
                .with_life_span(900.0 + 40.0 * i as f32);
            env.add_organism(organism, Position::new(60.0 + 60.0 * i as f32, 120.0))
                .expect("fleeing organism");
        }
        for i in 0..3 {
            let organism = Organism::new(Genome::new([30, 80, 60, 0]))
                .with_reaction(strategies::chase_prey(1.5))
                .with_interaction(strategies::predation(1.5));
            env.add_organism(organism, Position::new(120.0 + 150.0 * i as f32, 300.0))
                .expect("chasing organism");
        }
        for i in 0..20 {
            env.add_food(Food::default(), Position::new(40.0 + 26.0 * i as f32, 200.0))
                .expect("food");
        }
        env
    };

    let mut left = build();
    let mut right = build();
    left.simulate_iteration(120).expect("left run");
    right.simulate_iteration(120).expect("right run");

    assert_eq!(left.history(), right.history());
    let left_orgs = left.all_organisms();
    let right_orgs = right.all_organisms();
    assert_eq!(left_orgs.len(), right_orgs.len());
    for (l, r) in left_orgs.iter().zip(&right_orgs) {
        assert_eq!(l.position, r.position);
        assert_eq!(l.genome, r.genome);
        assert_eq!(l.life_span, r.life_span);
    }
}

#[test]
fn starved_population_declines_monotonically() {
    let mut env = Environment::new(EnvironmentConfig {
        worker_count: 1,
        rng_seed: Some(13),
        ..EnvironmentConfig::default()
    })
    .expect("environment");
    for i in 0..10 {
        let organism =
            Organism::new(Genome::default()).with_life_span(40.0 + 35.0 * i as f32);
        env.add_organism(organism, Position::new(50.0 + 40.0 * i as f32, 500.0))
            .expect("organism");
    }

    let mut counts = vec![env.organism_count()];
    env.simulate_iteration_with(400, |world| counts.push(world.organism_count()))
        .expect("run");

    assert!(
        counts.windows(2).all(|pair| pair[1] <= pair[0]),
        "population never grows without food"
    );
    assert_eq!(*counts.last().expect("counts"), 0);
    assert_eq!(env.dead_organisms().len(), 10, "each death reported once");
}
