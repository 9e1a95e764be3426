use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tornet", version = "0.1.0", about = "Tor network simulation sweeps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StagePolicyArg {
    #[value(name = "always")]
    Always,
    #[value(name = "if-missing")]
    IfMissing,
}

impl From<StagePolicyArg> for tornet_runner::StagePolicy {
    fn from(value: StagePolicyArg) -> Self {
        match value {
            StagePolicyArg::Always => tornet_runner::StagePolicy::Always,
            StagePolicyArg::IfMissing => tornet_runner::StagePolicy::IfMissing,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run {
        date: String,
        dirtiness: Vec<u64>,
        #[arg(long, default_value_t = 0.01)]
        scale: f64,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value = ".")]
        output_root: PathBuf,
        #[arg(long, default_value = ".")]
        data_root: PathBuf,
        #[arg(long, value_enum)]
        stage_policy: Option<StagePolicyArg>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        bin_dir: Option<PathBuf>,
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Fetch {
        date: String,
        #[arg(long, default_value = ".")]
        data_root: PathBuf,
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        date: String,
        dirtiness: Vec<u64>,
        #[arg(long, default_value_t = 0.01)]
        scale: f64,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value = ".")]
        output_root: PathBuf,
        #[arg(long, default_value = ".")]
        data_root: PathBuf,
        #[arg(long)]
        sources: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            date,
            dirtiness,
            scale,
            seed,
            output_root,
            data_root,
            stage_policy,
            workers,
            bin_dir,
            sources,
            json,
        } => {
            let bucket = tornet_runner::DateBucket::parse(&date)?;
            let mut plan = tornet_runner::SweepPlan::new(bucket);
            plan.dirtiness = dirtiness;
            plan.scale = scale;
            plan.seed = seed;
            plan.output_root = output_root;
            plan.data_root = data_root;
            if let Some(policy) = stage_policy {
                plan.stage_policy = policy.into();
            }
            plan.workers = workers;
            plan.bin_dir = bin_dir;
            if let Some(path) = sources {
                plan.sources = tornet_runner::load_sources(&path)?;
            }
            let fetcher = tornet_runner::HttpFetcher::new()?;
            let runner = tornet_core::ProcessRunner::new();
            let result = tornet_runner::run_sweep(&plan, &fetcher, &runner)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "sweep": sweep_result_to_json(&result),
                })));
            }
            println!("experiment: {}", result.experiment_name);
            println!("project_dir: {}", result.project_dir.display());
            println!("dialect: {}", result.dialect.label());
            println!("staged: {}", result.staged);
            println!("generated: {}", result.generated);
            for variant in &result.variants {
                println!(
                    "variant: {} ({}, simulated: {})",
                    variant.name,
                    variant.source.label(),
                    variant.simulated
                );
            }
        }
        Commands::Fetch {
            date,
            data_root,
            sources,
            json,
        } => {
            let bucket = tornet_runner::DateBucket::parse(&date)?;
            let sources = match sources {
                Some(path) => tornet_runner::load_sources(&path)?,
                None => tornet_runner::default_sources(),
            };
            let paths = tornet_runner::BucketPaths::resolve(&data_root, &bucket);
            let fetcher = tornet_runner::HttpFetcher::new()?;
            let runner = tornet_core::ProcessRunner::new();
            let cache = tornet_runner::ArtifactCache::new(&sources, &fetcher, &runner);
            cache.ensure(&bucket, &paths)?;
            let complete = cache.is_complete(&bucket, &paths);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "fetch",
                    "bucket": bucket.label(),
                    "data_dir": paths.data_dir.display().to_string(),
                    "complete": complete,
                })));
            }
            println!("bucket: {}", bucket.label());
            println!("data_dir: {}", paths.data_dir.display());
            println!("complete: {}", complete);
        }
        Commands::Describe {
            date,
            dirtiness,
            scale,
            seed,
            output_root,
            data_root,
            sources,
            json,
        } => {
            let bucket = tornet_runner::DateBucket::parse(&date)?;
            let mut plan = tornet_runner::SweepPlan::new(bucket);
            plan.dirtiness = dirtiness;
            plan.scale = scale;
            plan.seed = seed;
            plan.output_root = output_root;
            plan.data_root = data_root;
            if let Some(path) = sources {
                plan.sources = tornet_runner::load_sources(&path)?;
            }
            let preview = tornet_runner::describe_sweep(&plan);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "preview": preview_to_json(&preview),
                })));
            }
            print_preview(&preview);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Fetch { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}

fn sweep_result_to_json(result: &tornet_runner::SweepResult) -> Value {
    json!({
        "experiment": result.experiment_name,
        "project_dir": result.project_dir.display().to_string(),
        "dialect": result.dialect.label(),
        "staged": result.staged,
        "generated": result.generated,
        "variants": result.variants.iter().map(variant_to_json).collect::<Vec<_>>(),
    })
}

fn variant_to_json(variant: &tornet_runner::ExperimentVariant) -> Value {
    json!({
        "name": variant.name,
        "path": variant.path.display().to_string(),
        "source": variant.source.label(),
        "dirtiness": variant.dirtiness,
        "simulated": variant.simulated,
    })
}

fn preview_to_json(preview: &tornet_runner::SweepPreview) -> Value {
    json!({
        "experiment": preview.experiment_name,
        "project_dir": preview.project_dir.display().to_string(),
        "data_dir": preview.data_dir.display().to_string(),
        "artifact_urls": preview.artifact_urls,
        "variants": preview.variant_names,
    })
}

fn print_preview(preview: &tornet_runner::SweepPreview) {
    println!("experiment: {}", preview.experiment_name);
    println!("project_dir: {}", preview.project_dir.display());
    println!("data_dir: {}", preview.data_dir.display());
    for url in &preview.artifact_urls {
        println!("artifact: {}", url);
    }
    for name in &preview.variant_names {
        println!("variant: {}", name);
    }
}
