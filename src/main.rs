//! FlowRunner CLI Entry Point
//!
//! Runs a serial workflow document synchronously and prints the run
//! descriptor as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner workflow.yaml
//!
//! # Keep run folders below another base directory
//! flowrunner workflow.yaml --base-dir /data/flowrunner
//!
//! # Use an engine configuration and pass run arguments
//! flowrunner workflow.yaml --config engine.yaml --arg greeting=Hi --arg count=3
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use serde_json::Value;

use flowrunner::execution::config::runs_dir_from_env;
use flowrunner::execution::{EngineConfig, SerialWorkflowEngine};
use flowrunner::volume::{BucketVolume, FileSystemStorage, MemoryBucket, StorageVolume};
use flowrunner::workflow::{
    load_workflow, FunctionRegistry, RunArgument, RunArguments, RunDescriptor, RunHandle,
};
use flowrunner::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: String,
    base_dir: PathBuf,
    config_path: Option<PathBuf>,
    run_id: Option<String>,
    arguments: Vec<(String, Value)>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: DEFAULT_WORKFLOW.to_string(),
            base_dir: PathBuf::from("."),
            config_path: None,
            run_id: None,
            arguments: Vec::new(),
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner to stderr, keeping stdout for the result.
fn print_banner() {
    eprintln!();
    eprintln!("{} v{}", APP_NAME, VERSION);
    eprintln!("Serial Workflow Execution Engine");
    eprintln!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --base-dir PATH     Base directory for run folders (default: .)");
    println!("  --config PATH       Engine configuration file");
    println!("  --run-id ID         Identifier of the run (default: random)");
    println!("  --arg KEY=VALUE     Run argument; VALUE is parsed as JSON if possible");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner pipeline.yaml");
    println!("  flowrunner pipeline.yaml --arg greeting=Hi --arg count=3");
    println!("  flowrunner pipeline.yaml --base-dir /data/flowrunner --config engine.yaml");
}

/// Parses a `KEY=VALUE` run argument.
fn parse_run_argument(arg: &str) -> Result<(String, Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("Invalid argument '{}', expected KEY=VALUE", arg))?;
    if key.trim().is_empty() {
        return Err(format!("Invalid argument '{}', empty key", arg));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Returns the value following option `name`.
fn option_value<'a>(args: &'a [String], i: usize, name: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", name))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--base-dir" => {
                i += 1;
                config.base_dir = PathBuf::from(option_value(args, i, "--base-dir")?);
            }
            "--config" => {
                i += 1;
                config.config_path = Some(PathBuf::from(option_value(args, i, "--config")?));
            }
            "--run-id" => {
                i += 1;
                config.run_id = Some(option_value(args, i, "--run-id")?.to_string());
            }
            "--arg" => {
                i += 1;
                let value = parse_run_argument(option_value(args, i, "--arg")?)?;
                config.arguments.push(value);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workflow_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Collects the static files of the workflow into an in-memory volume.
fn static_files(
    workflow_path: &Path,
    inputs: &[String],
    run_id: &str,
) -> Result<BucketVolume, Box<dyn std::error::Error>> {
    let staticfs = BucketVolume::open(&format!("static-{}", run_id), "", Some("static"));
    if inputs.is_empty() {
        return Ok(staticfs);
    }
    let workflow_dir = workflow_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let source = FileSystemStorage::new(workflow_dir, Some("workflow"))?;
    let copied = source.copy(Some(inputs), None, &staticfs)?;
    info!("Static files: {} from {}", copied.len(), workflow_dir.display());
    Ok(staticfs)
}

/// Main application entry point; returns true if the run succeeded.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load workflow
    info!("Loading workflow: {}", config.workflow_path);
    let template = load_workflow(&config.workflow_path, &FunctionRegistry::new()).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path, e
        )
    })?;
    info!(
        "Workflow loaded: {} steps, {} outputs",
        template.steps.len(),
        template.outputs.len()
    );

    // Load engine configuration
    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };

    // Create engine
    std::fs::create_dir_all(&config.base_dir)?;
    let base_dir = std::fs::canonicalize(&config.base_dir)?;
    let fs: Arc<dyn StorageVolume> = Arc::new(FileSystemStorage::new(base_dir, Some("base"))?);
    info!("Base directory: {}", fs.describe());
    let engine = SerialWorkflowEngine::new(fs, engine_config, false, None)
        .with_runs_dir(runs_dir_from_env());

    let run = match config.run_id {
        Some(id) => RunHandle::new(id),
        None => RunHandle::generate(),
    };
    let staticfs = static_files(Path::new(&config.workflow_path), &template.inputs, &run.run_id)?;
    let arguments: RunArguments = config
        .arguments
        .into_iter()
        .map(|(key, value)| (key, RunArgument::Value(value)))
        .collect();

    // Execute workflow
    info!("Starting run {}", run.run_id);
    let outcome = engine.exec_workflow(&run, &template, arguments, &staticfs, None);
    MemoryBucket::drop_named(&format!("static-{}", run.run_id));
    let (state, runstore) = outcome?;

    let descriptor = RunDescriptor::new(&run.run_id, &state);
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    info!("Run folder: {}", runstore.describe());

    Ok(state.is_success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
