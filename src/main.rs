use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use mocasm::{EmitterConfig, Scenario, WordWidth};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WidthArg {
    W32,
    W64,
}

impl From<WidthArg> for WordWidth {
    fn from(arg: WidthArg) -> Self {
        match arg {
            WidthArg::W32 => WordWidth::W32,
            WidthArg::W64 => WordWidth::W64,
        }
    }
}

#[derive(Parser)]
#[command(name = "mocasm")]
#[command(about = "Emit and simulate macro-assembler sequences", long_about = None)]
struct Cli {
    #[command(flatten)]
    options: ConfigOptions,

    #[command(subcommand)]
    command: Commands,
}

/// Emitter options; command line flags override the config file.
#[derive(Args)]
struct ConfigOptions {
    /// Load emitter configuration from a TOML file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Target pointer width
    #[arg(long, global = true, value_enum)]
    width: Option<WidthArg>,

    /// Emit debug assertions
    #[arg(long, global = true)]
    debug_code: bool,

    /// Disable the inline allocation fast path
    #[arg(long, global = true)]
    no_inline_new: bool,

    /// Whether incremental marking may be active (true or false)
    #[arg(long, global = true, value_name = "BOOL")]
    incremental_marking: Option<bool>,

    /// Trace emission and simulation to stderr
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available scenarios
    List,
    /// Print the instruction listing of a scenario
    Emit {
        /// Scenario name (see `mocasm list`)
        scenario: Scenario,
    },
    /// Emit a scenario and run it on the simulator
    Run {
        /// Scenario name (see `mocasm list`)
        scenario: Scenario,

        /// Scenario input; may be repeated
        #[arg(long = "arg", value_name = "N", allow_negative_numbers = true)]
        args: Vec<f64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn build_config(options: &ConfigOptions) -> Result<EmitterConfig, String> {
    let mut config = match &options.config {
        Some(path) => EmitterConfig::load(path)?,
        None => EmitterConfig::default(),
    };
    if let Some(width) = options.width {
        config.width = width.into();
    }
    if options.debug_code {
        config.debug_code = true;
    }
    if options.no_inline_new {
        config.inline_new = false;
    }
    if let Some(marking) = options.incremental_marking {
        config.incremental_marking = marking;
    }
    if options.trace {
        config.trace = true;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match build_config(&cli.options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::List => {
            for scenario in Scenario::ALL {
                println!("{:<16} {}", scenario.name(), scenario.description());
            }
        }
        Commands::Emit { scenario } => match scenario.emit(&config) {
            Ok(program) => {
                print!("{}", program.code);
                eprintln!(
                    "{} instructions, {} write barrier stub calls",
                    program.code.len(),
                    program.stats.write_barriers_static
                );
            }
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        Commands::Run { scenario, args, json } => {
            if let Err(e) = run(scenario, &config, &args, json) {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

#[cfg(feature = "sim")]
fn run(scenario: Scenario, config: &EmitterConfig, args: &[f64], json: bool) -> Result<(), String> {
    let report = mocasm::sim::run_scenario(scenario, config, args).map_err(|e| e.to_string())?;
    if json {
        let text = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }

    println!(
        "{} ({}): {} instructions, {} steps",
        report.scenario, report.width, report.instructions, report.steps
    );
    for (key, value) in &report.results {
        println!("  {:<20} {}", key, value);
    }
    println!("registers:");
    for (name, value) in &report.registers {
        println!("  {:<4} {}", name, value);
    }
    for (name, value) in &report.doubles {
        println!("  {:<4} {:?}", name, value);
    }
    println!("counters:");
    for (name, value) in &report.counters {
        println!("  {:<24} {}", name, value);
    }
    if !report.calls.is_empty() {
        println!("calls:");
        for call in &report.calls {
            println!("  {}", call);
        }
    }
    Ok(())
}

#[cfg(not(feature = "sim"))]
fn run(_scenario: Scenario, _config: &EmitterConfig, _args: &[f64], _json: bool) -> Result<(), String> {
    Err("mocasm was built without the simulator (feature `sim`)".to_string())
}
