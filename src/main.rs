use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use piperun::checkpoint::CheckpointStore;
use piperun::lockfile::LockManager;
use piperun::manifest::{parse_stats, read_phase, read_status};
use piperun::observability::write_snapshot_json;
use piperun::pipeline::PipelineManager;
use piperun::recipe::Recipe;
use piperun::validation::{check_commands, validate_recipe};
use piperun::PipelineError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let otlp_endpoint = match &cli.command {
        Commands::Run { otlp_endpoint, .. } => otlp_endpoint.clone(),
        _ => None,
    };

    if let Err(err) = configure_tracing(otlp_endpoint.as_deref()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }

    let command_result: Result<()> = match cli.command {
        Commands::Run {
            pipeline,
            output_dir,
            new_start,
            recover,
            dirty,
            dry_run,
            metrics_json,
            otlp_endpoint: _,
        } => run_pipeline(RunArgs {
            pipeline,
            output_dir,
            new_start,
            recover,
            dirty,
            dry_run,
            metrics_json,
        }),
        Commands::Validate { pipeline } => validate_pipeline_cmd(pipeline),
        Commands::Status { output_dir, name } => status_cmd(output_dir, name),
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match command_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let code = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code.clamp(1, 255) as u8)
        }
    }
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "piperun")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct RunArgs {
    pipeline: PathBuf,
    output_dir: Option<PathBuf>,
    new_start: bool,
    recover: bool,
    dirty: bool,
    dry_run: bool,
    metrics_json: Option<PathBuf>,
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let mut recipe = Recipe::load(&args.pipeline)?;
    let mut report = validate_recipe(&recipe);
    report.merge(check_commands(&recipe));
    for warning in &report.warnings {
        warn!(file = %args.pipeline.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %args.pipeline.display(), "{error_msg}");
        }
        bail!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        );
    }

    if let Some(output_dir) = args.output_dir {
        recipe.output_dir = output_dir;
    }
    recipe.settings.new_start |= args.new_start;
    recipe.settings.recover |= args.recover;
    recipe.settings.dirty |= args.dirty;

    if args.dry_run {
        info!(
            name = recipe.name.as_str(),
            output_dir = %recipe.output_dir.display(),
            "Loaded pipeline with {} step(s)",
            recipe.steps.len()
        );
        for spec in &recipe.steps {
            let step = spec.to_step();
            println!(
                "{}: {}",
                step.resolved_label(&recipe.output_dir),
                step.commands.join(" && ")
            );
        }
        return Ok(());
    }

    let mut manager =
        PipelineManager::new(&recipe.name, &recipe.output_dir, recipe.settings.clone())?;
    match recipe.execute(&mut manager) {
        Ok(()) => {}
        Err(PipelineError::Halted(label)) => {
            info!(label = label.as_str(), "Stopped after requested step");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }

    let snapshot = manager.stop_pipeline()?;
    if let Some(path) = args.metrics_json {
        write_snapshot_json(&snapshot, &path)?;
        info!(metrics = %path.display(), "Metrics written");
    }
    Ok(())
}

fn validate_pipeline_cmd(pipeline: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&pipeline)?;
    let mut report = validate_recipe(&recipe);
    report.merge(check_commands(&recipe));

    for warning in &report.warnings {
        warn!(file = %pipeline.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %pipeline.display(), "Pipeline validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %pipeline.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn status_cmd(output_dir: PathBuf, name: String) -> Result<()> {
    let Some(status) = read_status(&output_dir, &name) else {
        bail!(
            "No run named '{}' found in {}",
            name,
            output_dir.display()
        );
    };
    println!("status: {}", status.as_str());
    if let Some(phase) = read_phase(&output_dir, &name) {
        println!("phase: {phase}");
    }

    let checkpoints = CheckpointStore::new(&output_dir, &name).list()?;
    println!("checkpoints: {}", checkpoints.len());
    for label in &checkpoints {
        println!("  {label}");
    }

    let locks = LockManager::new(&output_dir, &name, false).list()?;
    if !locks.is_empty() {
        println!("locks (interrupted or running): {}", locks.len());
        for label in &locks {
            println!("  {label}");
        }
    }

    let stats_path = output_dir.join(format!("{name}_stats.tsv"));
    if let Ok(content) = std::fs::read_to_string(&stats_path) {
        for (key, value) in parse_stats(&content) {
            println!("{key}: {value}");
        }
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "piperun",
    version,
    about = "Resumable runner for shell command pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline file, skipping steps whose targets already exist.
    Run {
        pipeline: PathBuf,
        #[arg(long = "output-dir")]
        output_dir: Option<PathBuf>,
        #[arg(long = "new-start")]
        new_start: bool,
        #[arg(long)]
        recover: bool,
        #[arg(long)]
        dirty: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "otlp-endpoint")]
        otlp_endpoint: Option<String>,
    },
    Validate {
        pipeline: PathBuf,
    },
    /// Show the recorded state of a run.
    Status {
        output_dir: PathBuf,
        #[arg(long)]
        name: String,
    },
}
