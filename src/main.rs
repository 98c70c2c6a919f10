use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use ratt::config;
use ratt::engine::RunContext;
use ratt::hierarchy::{AcquireOptions, UiNode};
use ratt::memory::{build_report, suggestions};
use ratt::{AdbBridge, CancelToken, Engine, MemoryStore, RunMode, Session, parse_flow};

/// ratt - resilient mobile UI automation
#[derive(Parser, Debug)]
#[command(
    name = "ratt",
    about = "Run Maestro-style UI flows on Android with self-healing locators and run memory",
    after_help = "ENVIRONMENT VARIABLES:\n\
        RATT_DEVICE_SERIAL     Device serial (falls back to ANDROID_SERIAL)\n\
        RATT_MEMORY_PATH       Memory store document\n\
        RATT_ARTIFACT_DIR      Base directory for run artifacts\n\
        RATT_LLM_ENDPOINT      Chat completions endpoint\n\
        RATT_OPENAI_KEY        LLM key (also OPENAI_API_KEY, GOOGLE_API_KEY)\n\
        RUST_LOG               Log filter (default: ratt=info)"
)]
struct Args {
    /// Memory store document
    #[arg(long, global = true, env = "RATT_MEMORY_PATH")]
    memory: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one flow file
    Run {
        flow: PathBuf,

        /// Test name (default: flow header name, then file stem)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run every .yaml/.yml flow in a directory, in name order
    RunFolder { dir: PathBuf },

    /// Parse a flow file without running it
    Validate { flow: PathBuf },

    /// List connected devices ready for automation
    Devices,

    /// Dump the current UI hierarchy of the device as JSON
    Hierarchy,

    /// List recorded runs
    Runs,

    /// Show the report of a run
    Report { run_id: String },

    /// Delete a run with its actions and failures
    DeleteRun { run_id: String },

    /// Suggest improvements from recorded runs
    Suggest,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ratt=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Execute a command; `Ok(false)` means it ran but something failed
fn run(args: Args) -> Result<bool, Box<dyn Error>> {
    let memory_path = args.memory.unwrap_or_else(config::memory_path);

    match args.command {
        Commands::Run { flow, name } => {
            let engine = engine(&memory_path)?;
            let parsed = parse_flow(&std::fs::read_to_string(&flow)?)?;
            let test_name = name.unwrap_or_else(|| parsed.test_name(file_stem(&flow)));
            let outcome = engine.run_flow(&parsed, &test_name, &CancelToken::new(), |event| {
                println!("{}", event)
            })?;
            if let Some(error) = &outcome.error {
                println!("\nFailed: {}", error);
            }
            let captures = Session::for_run(engine.artifact_root(), &outcome.run_id).list_captures()?;
            if !captures.is_empty() {
                println!("\nArtifacts:");
                for path in &captures {
                    println!("  {}", path.display());
                }
            }
            Ok(outcome.passed())
        }

        Commands::RunFolder { dir } => {
            let engine = engine(&memory_path)?;
            let outcomes = engine.run_folder(&dir, &CancelToken::new(), |_, event| println!("{}", event))?;

            println!("\nSummary:");
            let mut all_passed = true;
            for file in &outcomes {
                let verdict = match (&file.outcome, &file.error) {
                    (Some(outcome), _) => outcome.status.to_string(),
                    (None, Some(error)) => format!("ERROR ({})", error),
                    (None, None) => "ERROR".to_string(),
                };
                all_passed &= file.passed();
                println!("  {:<40} {}", file.path.display(), verdict);
            }
            Ok(all_passed)
        }

        Commands::Validate { flow } => {
            let parsed = parse_flow(&std::fs::read_to_string(&flow)?)?;
            println!(
                "{}: {} steps, test name '{}'",
                flow.display(),
                parsed.steps.len(),
                parsed.test_name(file_stem(&flow))
            );
            if let Some(app_id) = &parsed.app_id {
                println!("  appId: {}", app_id);
            }
            for (i, step) in parsed.steps.iter().enumerate() {
                println!("  {:>3} {:<22} {}", i + 1, step.op.kind(), step.raw);
            }
            Ok(true)
        }

        Commands::Devices => {
            let devices = AdbBridge::default().list_devices()?;
            if devices.is_empty() {
                println!("No devices attached");
                return Ok(false);
            }
            for serial in &devices {
                println!("{}", serial);
            }
            Ok(true)
        }

        Commands::Hierarchy => {
            let engine = engine(&memory_path)?;
            let mut run = RunContext::new("hierarchy", "hierarchy", RunMode::Learn);
            let snapshot = engine.acquire(&mut run, AcquireOptions::fresh())?;
            let tree: &UiNode = &snapshot.tree;
            println!("{}", serde_json::to_string_pretty(tree)?);
            eprintln!("screen hash: {}", snapshot.screen_hash);
            Ok(true)
        }

        Commands::Runs => {
            let memory = MemoryStore::open(&memory_path)?;
            let runs = memory.runs();
            if runs.is_empty() {
                println!("No runs recorded in {}", memory_path.display());
            }
            for run in runs.iter().rev() {
                println!(
                    "{}  {:<30} {:<5} {:<7} {:>8}ms  confidence {:.2}  {}",
                    run.run_id,
                    run.test_name,
                    run.mode,
                    run.status,
                    run.execution_time_ms,
                    run.confidence_score,
                    run.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(true)
        }

        Commands::Report { run_id } => {
            let memory = MemoryStore::open(&memory_path)?;
            let report = memory
                .read(|doc| build_report(doc, &run_id))
                .ok_or_else(|| format!("Run not found: {}", run_id))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }

        Commands::DeleteRun { run_id } => {
            let memory = MemoryStore::open(&memory_path)?;
            if memory.delete_run(&run_id)? {
                println!("Deleted run {}", run_id);
                Ok(true)
            } else {
                println!("Run not found: {}", run_id);
                Ok(false)
            }
        }

        Commands::Suggest => {
            let memory = MemoryStore::open(&memory_path)?;
            let found = memory.read(suggestions);
            if found.is_empty() {
                println!("No suggestions: every element and recent run looks healthy.");
            } else {
                println!("{}", serde_json::to_string_pretty(&found)?);
            }
            Ok(true)
        }
    }
}

fn engine(memory_path: &Path) -> Result<Engine, Box<dyn Error>> {
    let memory = MemoryStore::open(memory_path)?;
    Ok(Engine::new(
        Arc::new(AdbBridge::default()),
        Arc::new(memory),
        ratt::llm::from_config(),
        config::get().wait.clone(),
    ))
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}
