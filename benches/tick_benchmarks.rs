use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use twinrs::{
    AthleteModel, AthleteState, NullPublisher, PhysiologyModel, RiskEvaluator, SimulationEngine,
    SimulatorConfig, TickContext,
};

/// Tick throughput benchmarks
///
/// A tick must stay far below the one-second cadence even with many
/// athletes tracked.

fn bench_engine_tick(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("Engine Tick");

    for &athletes in &[1usize, 10, 100, 1000] {
        let engine = SimulationEngine::builder(SimulatorConfig {
            seed: Some(1),
            ..SimulatorConfig::default()
        })
        .publisher(Arc::new(NullPublisher))
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();
        for i in 0..athletes {
            engine.start(format!("athlete-{}", i)).unwrap();
        }
        // ticks are driven by hand below
        engine.halt();

        let mut now = Utc::now();
        group.throughput(Throughput::Elements(athletes as u64));
        group.bench_with_input(BenchmarkId::new("tick_at", athletes), &engine, |b, engine| {
            b.iter(|| {
                now += Duration::seconds(1);
                black_box(engine.tick_at(now));
            });
        });
    }

    group.finish();
}

fn bench_model_advance(c: &mut Criterion) {
    let model = PhysiologyModel::default();
    let mut rng = StdRng::seed_from_u64(7);
    let now = Utc::now();
    let state = AthleteState::baseline(now);
    let ctx = TickContext::between(now, now + Duration::seconds(1));

    c.bench_function("physiology_advance", |b| {
        b.iter(|| black_box(model.advance("A1", &state, &ctx, &mut rng)));
    });
}

fn bench_risk_evaluation(c: &mut Criterion) {
    let evaluator = RiskEvaluator::default();
    let mut state = AthleteState::baseline(Utc::now());
    state.heart_rate = 180.0;
    state.hrv = 25.0;

    c.bench_function("risk_evaluate", |b| {
        b.iter(|| black_box(evaluator.evaluate(&state)));
    });
}

criterion_group!(benches, bench_engine_tick, bench_model_advance, bench_risk_evaluation);
criterion_main!(benches);
