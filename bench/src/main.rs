use mocasm::sim::run_scenario;
use mocasm::{EmitterConfig, Scenario, WordWidth};
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    width: String,
    instructions: usize,
    steps: u64,
    emit_secs: f64,
    run_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    iterations: u32,
    results: Vec<BenchmarkResult>,
}

const ITERATIONS: u32 = 1000;

fn time<F>(mut f: F) -> f64
where
    F: FnMut(),
{
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        f();
    }
    start.elapsed().as_secs_f64() / ITERATIONS as f64
}

fn bench_scenario(scenario: Scenario, config: &EmitterConfig) -> Option<BenchmarkResult> {
    let report = match run_scenario(scenario, config, &[]) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Scenario {} ({}) failed: {}", scenario, config.width, e);
            return None;
        }
    };

    let emit_secs = time(|| {
        let _ = scenario.emit(config);
    });
    let run_secs = time(|| {
        let _ = run_scenario(scenario, config, &[]);
    });

    Some(BenchmarkResult {
        name: scenario.name().to_string(),
        width: config.width.to_string(),
        instructions: report.instructions,
        steps: report.steps,
        emit_secs,
        run_secs,
    })
}

fn main() {
    let mut results = Vec::new();

    for width in [WordWidth::W64, WordWidth::W32] {
        let config = EmitterConfig::default().with_width(width);
        for scenario in Scenario::ALL {
            results.extend(bench_scenario(scenario, &config));
        }
    }

    let output = BenchmarkOutput { iterations: ITERATIONS, results };
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
