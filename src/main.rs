//! CircRunner CLI Entry Point
//!
//! Provides a command-line interface for submitting and running pipelines.
//!
//! # Usage
//!
//! ```bash
//! # Register a pipeline and run it right away
//! circrunner submit pipeline.yaml --run
//!
//! # Resume interrupted pipelines, then run everything pending
//! circrunner run
//!
//! # Inspect a run
//! circrunner status 6f0d3c1e-8a9b-4a57-9d3e-0c3f4d1f2a11
//! circrunner logs 6f0d3c1e-8a9b-4a57-9d3e-0c3f4d1f2a11
//!
//! # Register a reference genome
//! circrunner resource add hg38 GENOME /ref/hg38.fa --user <UUID> --species human
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use colored::{ColoredString, Colorize};
use log::{info, warn};
use uuid::Uuid;

use circrunner::catalog::ResourceCatalog;
use circrunner::config::EngineConfig;
use circrunner::execution::{CommandExecutor, ExecutorRegistry};
use circrunner::monitoring::ExecutionTimeline;
use circrunner::orchestrator::{Orchestrator, PipelineStatus};
use circrunner::pipeline::{load_request, PipelineLog, Resource, ResourceType, RunStatus};
use circrunner::store::{ResourceFilter, Store};
use circrunner::{APP_NAME, VERSION};

/// What to do, parsed from positional arguments.
#[derive(Debug, PartialEq)]
enum Command {
    Submit { file: PathBuf, run: bool },
    Run,
    Status(Uuid),
    Logs { pipeline: Uuid, step: Option<Uuid> },
    Cancel(Uuid),
    Delete(Uuid),
    List { user: Option<Uuid> },
    ResourceAdd {
        name: String,
        resource_type: ResourceType,
        path: String,
        user: Uuid,
        species: Option<String>,
        version: Option<String>,
    },
    ResourceList {
        resource_type: Option<ResourceType>,
        species: Option<String>,
    },
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    database_path: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
    verbose: bool,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("circRNA Pipeline Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: circrunner [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  submit <PIPELINE_FILE> [--run]   Register a pipeline (YAML/JSON request)");
    println!("  run                              Resume interrupted pipelines, then run pending ones");
    println!("  status <PIPELINE_ID>             Show pipeline and step status");
    println!("  logs <PIPELINE_ID> [--step ID]   Show log entries");
    println!("  cancel <PIPELINE_ID>             Cancel a pending pipeline");
    println!("  delete <PIPELINE_ID>             Delete a pipeline and everything it owns");
    println!("  list [--user UUID]               List pipelines");
    println!("  resource add <NAME> <TYPE> <PATH> --user UUID [--species S] [--version V]");
    println!("  resource list [--type T] [--species S]");
    println!();
    println!("Options:");
    println!("  --db PATH           SQLite database (default: circrunner.db)");
    println!("  --output-dir PATH   Root of pipeline output directories (default: user_outputs)");
    println!("  --config FILE       Engine settings (YAML)");
    println!("  --timeout SECS      Per-step deadline");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  circrunner submit pipeline.yaml --run");
    println!("  circrunner --db /data/circrunner.db run");
    println!("  circrunner resource list --type GENOME --species human");
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {}: {}", what, value))
}

/// Returns the value following an option.
fn option_value(args: &[String], i: &mut usize, option: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut positionals: Vec<String> = Vec::new();
    let mut database_path = None;
    let mut output_dir = None;
    let mut config_file = None;
    let mut timeout_secs = None;
    let mut verbose = false;

    let mut run = false;
    let mut step = None;
    let mut user = None;
    let mut resource_type = None;
    let mut species = None;
    let mut version = None;

    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            // `resource add` takes a resource version; everywhere else this
            // prints ours.
            "--version" if positionals.first().map(String::as_str) == Some("resource") => {
                version = Some(option_value(args, &mut i, "--version")?);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => verbose = true,
            "--run" => run = true,
            "--db" => database_path = Some(PathBuf::from(option_value(args, &mut i, arg)?)),
            "--output-dir" => output_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?)),
            "--config" => config_file = Some(PathBuf::from(option_value(args, &mut i, arg)?)),
            "--timeout" => {
                let value = option_value(args, &mut i, arg)?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout value: {}", value))?;
                if secs == 0 {
                    return Err("--timeout must be positive".to_string());
                }
                timeout_secs = Some(secs);
            }
            "--step" => step = Some(parse_uuid(&option_value(args, &mut i, arg)?, "step id")?),
            "--user" => user = Some(parse_uuid(&option_value(args, &mut i, arg)?, "user id")?),
            "--type" => {
                let value = option_value(args, &mut i, arg)?;
                resource_type = Some(value.parse::<ResourceType>()?);
            }
            "--species" => species = Some(option_value(args, &mut i, arg)?),
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => positionals.push(arg.clone()),
        }
        i += 1;
    }

    let words: Vec<&str> = positionals.iter().map(String::as_str).collect();
    let command = match words.as_slice() {
        ["submit", file] => Command::Submit {
            file: PathBuf::from(file),
            run,
        },
        ["run"] => Command::Run,
        ["status", id] => Command::Status(parse_uuid(id, "pipeline id")?),
        ["logs", id] => Command::Logs {
            pipeline: parse_uuid(id, "pipeline id")?,
            step,
        },
        ["cancel", id] => Command::Cancel(parse_uuid(id, "pipeline id")?),
        ["delete", id] => Command::Delete(parse_uuid(id, "pipeline id")?),
        ["list"] => Command::List { user },
        ["resource", "add", name, kind, path] => Command::ResourceAdd {
            name: name.to_string(),
            resource_type: kind.parse()?,
            path: path.to_string(),
            user: user.ok_or("resource add requires --user")?,
            species,
            version,
        },
        ["resource", "list"] => Command::ResourceList {
            resource_type,
            species,
        },
        [] => return Err("Missing command".to_string()),
        _ => return Err(format!("Unexpected arguments: {}", positionals.join(" "))),
    };

    Ok(Config {
        command,
        database_path,
        output_dir,
        config_file,
        timeout_secs,
        verbose,
    })
}

/// Layers defaults, config file, environment and command-line flags.
fn engine_config(config: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut engine = match &config.config_file {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    engine.apply_env()?;

    if let Some(path) = &config.database_path {
        engine.database_path = path.clone();
    }
    if let Some(dir) = &config.output_dir {
        engine.output_dir = dir.clone();
    }
    if let Some(secs) = config.timeout_secs {
        engine.step_timeout_secs = Some(secs);
    }
    engine.validate()?;
    Ok(engine)
}

/// Colorize run status for display
fn colorize_status(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Pending => status.as_str().yellow(),
        RunStatus::Running => status.as_str().cyan(),
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Failed => status.as_str().red(),
    }
}

fn print_status(status: &PipelineStatus) {
    let pipeline = &status.pipeline;
    let (done, total) = status.progress();

    println!("Pipeline:  {} ({})", pipeline.name.bold(), pipeline.id);
    println!("Status:    {}", colorize_status(pipeline.status));
    println!("Progress:  {}/{} steps completed", done, total);
    if let Some(step) = status.current_step() {
        println!("Current:   {}", step.name.bold());
    }
    if let Some(notes) = &pipeline.notes {
        println!("Notes:     {}", notes);
    }
    if let Some(blocked) = &status.blocked {
        println!("Blocked:   [{}] {}", blocked.kind.to_string().red(), blocked.message);
    }

    println!();
    for step in &status.steps {
        println!(
            "  {:>2}. {:<24} {}",
            step.position + 1,
            step.name,
            colorize_status(step.status)
        );
    }

    let timeline = ExecutionTimeline::from_steps(&status.steps);
    if !timeline.is_empty() {
        print!("{}", timeline.gantt_chart(Utc::now()));
    }
}

fn print_logs(logs: &[PipelineLog]) {
    for log in logs {
        let scope = match log.step_id {
            Some(_) => "step".dimmed(),
            None => "pipeline".cyan(),
        };
        println!(
            "{} [{}] {}",
            log.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            scope,
            log.text
        );
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    let settings = engine_config(&config)?;
    let store = Arc::new(Store::open(&settings.database_path)?);
    let registry = Arc::new(ExecutorRegistry::new().with_default(CommandExecutor::new()));

    match config.command {
        Command::Submit { file, run } => {
            print_banner();
            info!("Loading pipeline: {}", file.display());
            let request = load_request(&file)?;

            let orchestrator = Orchestrator::new(store, registry, &settings)?;
            let submission = if run {
                orchestrator.submit(&request)?
            } else {
                orchestrator.register(&request)?
            };
            println!("Pipeline {} is {}", submission.id, colorize_status(submission.status));

            if run && submission.status == RunStatus::Pending {
                orchestrator.wait_idle();
                println!();
                print_status(&orchestrator.status(submission.id)?);
            }
        }
        Command::Run => {
            print_banner();
            let orchestrator = Orchestrator::new(store, registry, &settings)?;
            let queued = orchestrator.recover()?;
            if queued == 0 {
                info!("Nothing to run");
            } else {
                orchestrator.wait_idle();
                info!("Processed {} pipeline(s)", queued);
            }
        }
        Command::Status(id) => {
            let orchestrator = Orchestrator::new(store, registry, &settings)?;
            print_status(&orchestrator.status(id)?);
        }
        Command::Logs { pipeline, step } => {
            let orchestrator = Orchestrator::new(store, registry, &settings)?;
            let logs = match step {
                Some(step_id) => orchestrator.step_logs(step_id)?,
                None => orchestrator.logs(pipeline)?,
            };
            print_logs(&logs);
        }
        Command::Cancel(id) => {
            let orchestrator = Orchestrator::new(store, registry, &settings)?;
            match orchestrator.cancel(id)? {
                RunStatus::Running => warn!(
                    "Pipeline {} is running in another process; stop that process to interrupt it",
                    id
                ),
                status => println!("Pipeline {} is {}", id, colorize_status(status)),
            }
        }
        Command::Delete(id) => {
            let orchestrator = Orchestrator::new(store, registry, &settings)?;
            orchestrator.delete(id)?;
            println!("Deleted pipeline {}", id);
        }
        Command::List { user } => {
            let orchestrator = Orchestrator::new(store, registry, &settings)?;
            for pipeline in orchestrator.list(user)? {
                println!(
                    "{}  {:<10} {}  {}",
                    pipeline.id,
                    colorize_status(pipeline.status),
                    pipeline.created_at.format("%Y-%m-%d %H:%M"),
                    pipeline.name
                );
            }
        }
        Command::ResourceAdd {
            name,
            resource_type,
            path,
            user,
            species,
            version,
        } => {
            let mut resource = Resource::new(name, resource_type, path, user);
            if let Some(species) = species {
                resource = resource.with_species(species);
            }
            if let Some(version) = version {
                resource = resource.with_version(version);
            }
            store.add_resource(&resource)?;
            println!("Added {} resource {}", resource.resource_type, resource.id);
        }
        Command::ResourceList {
            resource_type,
            species,
        } => {
            let filter = ResourceFilter {
                resource_type,
                species,
            };
            for resource in store.list_resources(&filter)? {
                println!(
                    "{}  {:<10} {:<20} {:<12} {}",
                    resource.id,
                    resource.resource_type,
                    resource.name,
                    resource.species.as_deref().unwrap_or("-"),
                    resource.file_path
                );
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
