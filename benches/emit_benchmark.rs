//! Emission and simulation throughput of the canned scenarios.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

use mocasm::sim::run_scenario;
use mocasm::{EmitterConfig, Scenario, WordWidth};

fn configs() -> [(&'static str, EmitterConfig); 3] {
    [
        ("w64", EmitterConfig::default()),
        ("w32", EmitterConfig::default().with_width(WordWidth::W32)),
        ("w64_debug", EmitterConfig::default().with_debug_code(true)),
    ]
}

fn bench_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit");
    group.measurement_time(Duration::from_secs(3));

    for (name, config) in configs() {
        for scenario in Scenario::ALL {
            group.bench_with_input(BenchmarkId::new(scenario.name(), name), &config, |b, config| {
                b.iter(|| scenario.emit(black_box(config)))
            });
        }
    }

    group.finish();
}

fn bench_simulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulate");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(3));

    let config = EmitterConfig::default();
    for scenario in [Scenario::Allocate, Scenario::RecordWrite, Scenario::Invoke, Scenario::Truncate] {
        group.bench_function(scenario.name(), |b| {
            b.iter(|| run_scenario(black_box(scenario), &config, &[]))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_emit, bench_simulate);
criterion_main!(benches);
