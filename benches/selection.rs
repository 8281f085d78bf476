use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use replica_router::balancer::{Candidate, SelectionAlgorithm, SelectionPolicy, WeightedRandom};
use replica_router::core::ReplicaId;
use replica_router::routing::{RoutingRule, RuleEngine};

fn candidates(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| Candidate {
            id: ReplicaId::from(format!("replica-{:04}", i)),
            healthy: i % 5 != 0,
            weight: (i % 4 + 1) as f64,
            priority: (i % 3) as i32,
            query_count: (i * 7 % 13) as u64,
        })
        .collect()
}

/// Weighted draw over the top priority tier
fn bench_weighted_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_random");
    let algorithm = WeightedRandom::with_seed(42);

    for count in [4, 32, 256].iter() {
        let pool: Vec<Candidate> = candidates(*count).into_iter().filter(|c| c.healthy).collect();
        group.bench_with_input(BenchmarkId::new("select", count), &pool, |b, pool| {
            b.iter(|| black_box(algorithm.select(black_box(pool))));
        });
    }

    group.finish();
}

/// Full precedence: rule, preference, weighted fallback
fn bench_selection_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection_policy");
    let policy = SelectionPolicy::new(Box::new(WeightedRandom::with_seed(42)));
    let pool = candidates(32);

    let engine = RuleEngine::new();
    for i in 0..16 {
        let rule = RoutingRule::new(
            &format!("table_{}_", i),
            vec![pool[i].id.clone(), pool[i + 1].id.clone()],
        )
        .unwrap();
        engine.add_rule(rule);
    }
    let is_healthy = |id: &ReplicaId| pool.iter().any(|c| &c.id == id && c.healthy);

    group.bench_function("rule_match", |b| {
        b.iter(|| {
            let rule = engine.evaluate(black_box("SELECT * FROM table_15_events"), is_healthy);
            black_box(policy.select(rule.as_ref(), &[], &pool))
        });
    });

    group.bench_function("weighted_fallthrough", |b| {
        b.iter(|| {
            let rule = engine.evaluate(black_box("SELECT * FROM tickets"), is_healthy);
            black_box(policy.select(rule.as_ref(), &[], &pool))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_weighted_random, bench_selection_policy);
criterion_main!(benches);
