//! Runs the canned scenarios on the simulator and reports what happened.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use super::{Simulator, Space, StubCall, addr};
use crate::asm::reg::{D0, D1, R2, R3, R4, R7, R8, R9};
use crate::asm::{DoubleRegister, Register};
use crate::config::EmitterConfig;
use crate::error::{EmitError, SimError};
use crate::layout::{Counter, RootIndex};
use crate::masm::scenarios::{EXIT_FRAME_C_FUNCTION, Program, Scenario};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("emit: {0}")]
    Emit(#[from] EmitError),
    #[error("simulate: {0}")]
    Sim(#[from] SimError),
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub width: String,
    pub instructions: usize,
    pub steps: u64,
    /// Scenario specific results
    pub results: BTreeMap<String, String>,
    pub registers: BTreeMap<String, String>,
    pub doubles: BTreeMap<String, f64>,
    pub counters: BTreeMap<String, i32>,
    pub calls: Vec<String>,
}

impl RunReport {
    pub fn result(&self, key: &str) -> Option<&str> {
        self.results.get(key).map(String::as_str)
    }
}

/// Scenario inputs; missing arguments take the scenario's default.
fn arg(args: &[f64], index: usize, default: f64) -> f64 {
    args.get(index).copied().unwrap_or(default)
}

fn hex(value: u64) -> String {
    format!("{:#x}", value)
}

/// Emit `scenario`, set up its inputs from `args` and run it.
pub fn run_scenario(scenario: Scenario, config: &EmitterConfig, args: &[f64]) -> Result<RunReport, RunError> {
    let program = scenario.emit(config)?;
    let (sim, results) = run_program(&program, config, args)?;
    Ok(report(&program, &sim, results))
}

/// Run an emitted scenario; returns the final machine state and the
/// scenario specific results.
pub fn run_program(
    program: &Program,
    config: &EmitterConfig,
    args: &[f64],
) -> Result<(Simulator, BTreeMap<String, String>), RunError> {
    let mut sim = Simulator::new(program.code.clone(), config);
    let mut results = BTreeMap::new();
    let undefined = sim.root(RootIndex::UndefinedValue);

    match program.scenario {
        Scenario::Allocate => {
            let size = arg(args, 0, sim.layout().heap_number_size() as f64) as i64;
            sim.set_reg(R3, size as u64);
            sim.run_from(program.entry)?;
            record_allocation(&sim, undefined, &mut results);
        }
        Scenario::AllocateString => {
            let length = arg(args, 0, 5.0) as i64;
            sim.set_reg(R3, length as u64);
            sim.run_from(program.entry)?;
            record_allocation(&sim, undefined, &mut results);
            let string = sim.reg(R2);
            if string != undefined {
                let length_offset = sim.layout().string_length_offset();
                let length = sim.width().smi_value(sim.read_field(string, length_offset));
                results.insert("length".to_string(), length.to_string());
                let one_byte = sim.map_of(string) == sim.root(RootIndex::OneByteStringMap);
                results.insert("one_byte_map".to_string(), one_byte.to_string());
            }
        }
        Scenario::RecordWrite => {
            let object = sim.new_fixed_array(Space::Old, 4)?;
            let value = match arg(args, 0, 0.0) as i64 {
                0 => sim.new_heap_number(Space::New, 1.5)?,
                1 => sim.new_heap_number(Space::Old, 1.5)?,
                _ => sim.width().smi_bits(7),
            };
            sim.set_reg(R3, object);
            sim.set_reg(R4, value);
            sim.run_from(program.entry)?;
            let header = sim.layout().fixed_array_header_size();
            results.insert("stored".to_string(), (sim.read_field(object, header) == value).to_string());
            results.insert("stub_calls".to_string(), sim.record_write_calls().to_string());
            results.insert("store_buffer".to_string(), sim.store_buffer_entries().len().to_string());
        }
        Scenario::Invoke => {
            let actual = arg(args, 0, 2.0) as i32;
            let formal = arg(args, 1, 3.0) as i32;
            let callee = program.callee.ok_or(SimError::Native {
                name: "invoke".to_string(),
                message: "program has no callee".to_string(),
            })?;
            let entry = sim.code_address(callee).ok_or(SimError::UnboundLabel(callee.id()))?;
            let function = sim.new_js_function(formal, entry)?;
            sim.set_reg(R3, function);
            sim.set_reg(R2, actual as i64 as u64);
            sim.run_from(program.entry)?;
            results.insert("adapted".to_string(), (sim.adaptor_calls() > 0).to_string());
            results.insert("callee_argc".to_string(), sim.reg_signed(R7).to_string());
        }
        Scenario::ExitFrame => {
            let value = arg(args, 0, 40.0) as i64;
            sim.register_c_function(EXIT_FRAME_C_FUNCTION, |args| args[0].wrapping_add(args[1]));
            sim.set_reg(R2, value as u64);
            sim.run_from(program.entry)?;
            let alignment = config.frame_alignment.bytes() as u64;
            results.insert("c_result".to_string(), sim.reg_signed(R2).to_string());
            results.insert("c_entry_fp_recorded".to_string(), (sim.reg(R7) == sim.reg(R8)).to_string());
            results.insert("sp_aligned".to_string(), (sim.reg(R9) % alignment == 0).to_string());
            results.insert("c_entry_fp_after".to_string(), hex(sim.c_entry_fp()));
            results.insert("sp_restored".to_string(), (sim.sp() == addr::STACK_TOP).to_string());
        }
        Scenario::Floor | Scenario::Ceil => {
            let input = arg(args, 0, if program.scenario == Scenario::Floor { -1.5 } else { -0.5 });
            sim.set_dreg(D1, input);
            sim.run_from(program.entry)?;
            results.insert("result".to_string(), format!("{:?}", sim.dreg(D0)));
            results.insert("bits".to_string(), hex(sim.dreg_bits(D0)));
        }
        Scenario::Truncate => {
            let input = arg(args, 0, 4_294_967_298.5);
            sim.set_dreg(D1, input);
            sim.run_from(program.entry)?;
            results.insert("result".to_string(), sim.reg_i32(R2).to_string());
            let stub = sim.count_calls(|c| matches!(c, StubCall::DoubleToI { .. }));
            results.insert("stub_calls".to_string(), stub.to_string());
        }
    }
    Ok((sim, results))
}

fn record_allocation(sim: &Simulator, undefined: u64, results: &mut BTreeMap<String, String>) {
    let result = sim.reg(R2);
    if result == undefined {
        results.insert("path".to_string(), "slow".to_string());
    } else {
        results.insert("path".to_string(), "inline".to_string());
        results.insert("object".to_string(), hex(result));
        results.insert("new_space_top".to_string(), hex(sim.allocation_top(Space::New)));
    }
}

fn report(program: &Program, sim: &Simulator, results: BTreeMap<String, String>) -> RunReport {
    let registers = (0..Register::NUM_REGISTERS as u8)
        .map(Register::from_code)
        .map(|r| (r.to_string(), hex(sim.reg(r))))
        .collect();
    let doubles = (0..3u8)
        .map(DoubleRegister::from_code)
        .map(|d| (d.to_string(), sim.dreg(d)))
        .collect();
    let mut counters = BTreeMap::new();
    counters.insert(
        "write_barriers_dynamic".to_string(),
        sim.counter(Counter::WriteBarriersDynamic),
    );
    RunReport {
        scenario: program.scenario.name().to_string(),
        width: sim.width().to_string(),
        instructions: program.code.len(),
        steps: sim.steps(),
        results,
        registers,
        doubles,
        counters,
        calls: sim.calls().iter().map(|c| format!("{:?}", c)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::WordWidth;

    fn run(scenario: Scenario, args: &[f64]) -> RunReport {
        run_scenario(scenario, &EmitterConfig::default(), args).unwrap()
    }

    #[test]
    fn test_allocate_inline_then_slow() {
        let report = run(Scenario::Allocate, &[16.0]);
        assert_eq!(report.result("path"), Some("inline"));
        let report = run(Scenario::Allocate, &[1024.0 * 1024.0]);
        assert_eq!(report.result("path"), Some("slow"));
    }

    #[test]
    fn test_floor_and_ceil_defaults() {
        assert_eq!(run(Scenario::Floor, &[]).result("result"), Some("-2.0"));
        let ceil = run(Scenario::Ceil, &[]);
        assert_eq!(ceil.result("bits"), Some("0x8000000000000000"));
    }

    #[test]
    fn test_report_serializes() {
        let report = run(Scenario::Truncate, &[]);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"scenario\":\"truncate\""));
        assert_eq!(report.result("result"), Some("2"));
    }

    #[test]
    fn test_every_scenario_runs_on_both_widths() {
        for width in [WordWidth::W32, WordWidth::W64] {
            let config = EmitterConfig::default().with_width(width);
            for scenario in Scenario::ALL {
                let report = run_scenario(scenario, &config, &[]);
                assert!(report.is_ok(), "{} on {}: {:?}", scenario, width, report.err());
            }
        }
    }
}
