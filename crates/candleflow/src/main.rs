use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candleflow_core::{
    builtin_evaluations, builtin_transformations, register_pipeline, Pipeline, PipelineIdentity,
    Registration,
};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Configuration-driven candlestick dataset pipelines", long_about = None)]
struct Cli {
    /// Root directory holding `pipelines/` (defaults to $CANDLEFLOW_HOME, then the cwd)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// Do not echo run logs to stdout
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a pipeline version from a JSON registration record
    Register(RegisterArgs),
    /// Ingest a source file and stage its transformed dataset
    Ingest(IngestArgs),
    /// Evaluate staged datasets and route them to output or failed
    Evaluate(EvaluateArgs),
    /// List load control keys waiting in staging
    Staging(PipelineArgs),
    /// List the built-in transformations and evaluations
    Steps,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    file: PathBuf,
    /// Delete an existing pipeline version before registering
    #[arg(long)]
    overwrite: bool,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    version: String,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    key: String,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    #[arg(long, conflicts_with = "all_staged", required_unless_present = "all_staged")]
    key: Option<String>,
    /// Evaluate every key currently in staging
    #[arg(long)]
    all_staged: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let home = resolve_home(cli.home.clone())?;
    let echo = !cli.quiet;

    match cli.command {
        Command::Register(args) => handle_register(args),
        Command::Ingest(args) => handle_ingest(&home, echo, args),
        Command::Evaluate(args) => handle_evaluate(&home, echo, args),
        Command::Staging(args) => handle_staging(&home, args),
        Command::Steps => handle_steps(),
    }
}

fn resolve_home(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(home) = flag {
        return Ok(home);
    }
    if let Some(home) = env::var_os("CANDLEFLOW_HOME") {
        return Ok(PathBuf::from(home));
    }
    env::current_dir().context("failed to determine current directory")
}

fn open_pipeline(home: &Path, args: &PipelineArgs, echo: bool) -> Result<Pipeline> {
    let identity = PipelineIdentity::new(home, &args.name, &args.version);
    let pipeline = Pipeline::load(identity)
        .with_context(|| format!("failed to load pipeline {} v{}", args.name, args.version))?;
    Ok(pipeline.with_echo(echo))
}

fn handle_register(args: RegisterArgs) -> Result<()> {
    let registration = Registration::from_file(&args.file)
        .with_context(|| format!("failed to read registration {}", args.file.display()))?;
    let identity = register_pipeline(&registration, args.overwrite)?;
    println!("Registered {} at {}", identity, identity.root().display());
    Ok(())
}

fn handle_ingest(home: &Path, echo: bool, args: IngestArgs) -> Result<()> {
    let pipeline = open_pipeline(home, &args.pipeline, echo)?;
    let staged = pipeline.ingest_and_transform(&args.source, &args.key)?;
    info!(key = %args.key, path = %staged.display(), "ingest complete");
    println!("Staged {} at {}", args.key, staged.display());
    Ok(())
}

fn handle_evaluate(home: &Path, echo: bool, args: EvaluateArgs) -> Result<()> {
    let pipeline = open_pipeline(home, &args.pipeline, echo)?;
    let keys = match args.key {
        Some(key) => vec![key],
        None => pipeline.list_staging_keys()?,
    };

    if keys.is_empty() {
        println!("No staged datasets for {}", pipeline.identity());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["load control key", "outcome", "detail"]);

    let mut failures = 0usize;
    for key in &keys {
        match pipeline.evaluate_and_route(key) {
            Ok(path) => {
                table.add_row(vec![key.clone(), "output".to_string(), path.display().to_string()]);
            }
            Err(err) => {
                failures += 1;
                let detail = match err.evaluation_failures() {
                    Some(names) => names.join(", "),
                    None => err.root_cause().to_string(),
                };
                let outcome = if err.evaluation_failures().is_some() { "failed" } else { "error" };
                error!(key = %key, error = %err.root_cause(), "evaluation did not promote dataset");
                table.add_row(vec![key.clone(), outcome.to_string(), detail]);
            }
        }
    }

    println!("{table}");
    if failures > 0 {
        bail!("{failures} of {} staged dataset(s) were not promoted", keys.len());
    }
    Ok(())
}

fn handle_staging(home: &Path, args: PipelineArgs) -> Result<()> {
    let pipeline = open_pipeline(home, &args, false)?;
    let keys = pipeline.list_staging_keys()?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["load control key"]);
    for key in &keys {
        table.add_row(vec![key.as_str()]);
    }
    println!("{table}");
    println!("{} staged dataset(s) for {}", keys.len(), pipeline.identity());
    Ok(())
}

fn handle_steps() -> Result<()> {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["kind", "name", "description"]);
    for step in builtin_transformations().descriptors() {
        table.add_row(vec!["transformation", step.name, step.description]);
    }
    for step in builtin_evaluations().descriptors() {
        table.add_row(vec!["evaluation", step.name, step.description]);
    }
    println!("{table}");
    Ok(())
}
