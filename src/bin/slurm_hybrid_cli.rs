//! Slurm Hybrid CLI
//!
//! Commands: options, validate, render, plan, apply
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on validation or apply failure

use anyhow::Context;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use slurm_hybrid_core::{
    pipeline::PipelineError, schema::RawConfig, secrets::RecordingSecretStore,
    validation::ValidationPolicy, HybridPipeline,
};

#[derive(Parser)]
#[command(name = "slurm-hybrid-cli", version)]
#[command(about = "Render and apply the Slurm hybrid controller installer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON file with option values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override a single option (key=value, value parsed as JSON when possible)
    #[arg(short = 's', long = "set", global = true)]
    overrides: Vec<String>,

    /// Treat validation warnings as errors
    #[arg(long, global = true)]
    strict: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List known options with their defaults
    Options,

    /// Validate the configuration
    Validate,

    /// Render install_hybrid.sh without writing it (nothing when hybrid is disabled)
    Render {
        /// Print the script itself instead of a JSON envelope
        #[arg(long)]
        raw: bool,
    },

    /// Show the steps apply would run, in order
    Plan,

    /// Resolve, render and run every enabled step
    Apply,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("slurm_hybrid_core=info,slurm_hybrid_cli=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<RawConfig> {
    let mut raw = match &cli.config {
        Some(path) => RawConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RawConfig::new(),
    };
    for assignment in &cli.overrides {
        raw.apply_override(assignment)?;
    }
    Ok(raw)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Validation and apply failures exit with 2, everything else with 1.
fn failure(error: &PipelineError) -> anyhow::Result<ExitCode> {
    print_json(&serde_json::json!({
        "success": false,
        "error": error.to_string(),
    }))?;
    Ok(ExitCode::from(2))
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let policy = if cli.strict { ValidationPolicy::Strict } else { ValidationPolicy::Block };
    let secrets = Arc::new(RecordingSecretStore::new());
    let pipeline = HybridPipeline::new()?
        .with_policy(policy)
        .with_secret_store(secrets.clone());

    match &cli.command {
        Commands::Options => {
            print_json(&serde_json::to_value(pipeline.list_options())?)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate => {
            let raw = load_config(&cli)?;
            let result = pipeline.validate(&raw);
            print_json(&serde_json::to_value(&result)?)?;
            Ok(if result.valid { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }

        Commands::Render { raw: print_raw } => {
            let print_raw = *print_raw;
            let raw = load_config(&cli)?;
            match pipeline.render(&raw) {
                Ok(None) => {
                    print_json(&serde_json::json!({
                        "success": true,
                        "rendered": false,
                        "reason": "enable_hybrid is false",
                    }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Ok(Some(script)) if print_raw => {
                    print!("{}", script.content);
                    Ok(ExitCode::SUCCESS)
                }
                Ok(Some(script)) => {
                    print_json(&serde_json::json!({
                        "success": true,
                        "rendered": true,
                        "name": script.name,
                        "mode": format!("{:04o}", script.mode),
                        "sha256": script.sha256(),
                        "content_base64": base64::engine::general_purpose::STANDARD.encode(&script.content),
                    }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => failure(&e),
            }
        }

        Commands::Plan => {
            let raw = load_config(&cli)?;
            match pipeline.plan(&raw) {
                Ok(steps) => {
                    print_json(&serde_json::json!({ "success": true, "steps": steps }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => failure(&e),
            }
        }

        Commands::Apply => {
            let raw = load_config(&cli)?;
            match pipeline.deploy(&raw) {
                Ok(deployment) => {
                    print_json(&serde_json::json!({
                        "success": true,
                        "deployment": deployment,
                        "grants": secrets.grants(),
                    }))?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => failure(&e),
            }
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
