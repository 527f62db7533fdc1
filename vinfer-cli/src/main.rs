//! vinfer CLI entrypoint.
//!
//! ```bash
//! vinfer run --graph graph.json --streams 4 --frames 120 --json
//! vinfer validate --graph graph.json
//! vinfer graph-template --output graph.json
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use vinfer_core::error::{EngineError, Result};
use vinfer_pipeline::synthetic::synthetic_infer;
use vinfer_pipeline::{
    GRAPH_SCHEMA_VERSION, ModelRegistry, MultiStreamRunner, RunConfig, RunReport, StageGraph,
    WorkerPoolFactory,
};

#[derive(Parser, Debug)]
#[command(
    name = "vinfer",
    version,
    about = "Per-stage inference scheduling over synthetic streams",
    arg_required_else_help = true,
    after_help = "Examples:\n  vinfer graph-template --output graph.json\n  vinfer validate --graph graph.json --json\n  vinfer run --graph graph.json --streams 4 --frames 120 --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a stage graph over synthetic streams and report stage metrics.
    Run(RunArgs),
    /// Check a stage graph without loading any model.
    Validate(ValidateArgs),
    /// Print a detect-then-classify stage graph.
    GraphTemplate(TemplateArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// JSON stage graph path (built-in template when omitted).
    #[arg(long = "graph")]
    graph: Option<PathBuf>,

    /// Number of concurrent streams sharing the graph's model instances.
    #[arg(long = "streams", default_value_t = 1)]
    streams: usize,

    /// Frames generated per stream.
    #[arg(long = "frames", default_value_t = 32)]
    frames: u64,

    /// Synthetic frame width.
    #[arg(long = "width", default_value_t = 320)]
    width: u32,

    /// Synthetic frame height.
    #[arg(long = "height", default_value_t = 240)]
    height: u32,

    /// Pre-attached regions per frame.
    #[arg(long = "regions", default_value_t = 2)]
    regions: u32,

    /// Override every stage's flush timeout (milliseconds).
    #[arg(long = "flush-timeout-ms")]
    flush_timeout_ms: Option<u64>,

    /// Fail model loads whose `model_path` does not exist.
    #[arg(long = "require-model-files", default_value_t = false)]
    require_model_files: bool,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ValidateArgs {
    /// JSON stage graph path.
    #[arg(long = "graph")]
    graph: PathBuf,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct TemplateArgs {
    /// Write the template here instead of stdout.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Run(args) if args.json => Some("run"),
        Commands::Validate(args) if args.json => Some("validate"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Run(args) => match build_runtime() {
            Ok(rt) => rt.block_on(run_graph(args)),
            Err(e) => Err(e),
        },
        Commands::Validate(args) => run_validate(args),
        Commands::GraphTemplate(args) => run_template(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err.chain()));
            } else {
                tracing::error!(error = %err.chain(), code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Pipeline(format!("Failed to build tokio runtime: {e}")))
}

fn load_graph(path: Option<&Path>) -> Result<StageGraph> {
    match path {
        Some(path) => StageGraph::from_json_file(path),
        None => Ok(StageGraph::template()),
    }
}

async fn run_graph(args: RunArgs) -> Result<()> {
    let graph = load_graph(args.graph.as_deref())?;
    let factory = WorkerPoolFactory::new(|config| Ok(synthetic_infer(config)));
    let factory = if args.require_model_files {
        factory
    } else {
        factory.without_file_check()
    };
    let registry = Arc::new(ModelRegistry::new(Arc::new(factory)));
    let config = RunConfig {
        streams: args.streams,
        frames_per_stream: args.frames,
        width: args.width,
        height: args.height,
        regions_per_frame: args.regions,
        flush_timeout_ms: args.flush_timeout_ms,
    };
    let runner = MultiStreamRunner::new(graph, config, registry)?;
    let report = runner.run().await?;
    if !report.in_order {
        return Err(EngineError::InvariantViolation(
            "frames left a stream out of arrival order".into(),
        ));
    }

    if args.json {
        println!("{}", run_json(&report)?);
    } else {
        print_run_summary(&report);
    }
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    println!(
        "{} stream(s) in {} ms, in order: {}",
        report.streams.len(),
        report.elapsed_ms,
        report.in_order
    );
    for stream in &report.streams {
        println!(
            "  stream {}: {} in, {} out, {} tensors",
            stream.stream, stream.frames_in, stream.frames_out, stream.tensors_attached
        );
    }
    for stage in &report.stages {
        let m = &stage.metrics;
        println!(
            "  {:<16} instance={:<14} submitted={} completed={} failed={} skipped_interval={} backpressure={} pp_errors={}",
            stage.name,
            stage.instance_id,
            m.requests_submitted,
            m.requests_completed,
            m.requests_failed,
            m.frames_skipped_interval,
            m.skipped_backpressure,
            m.postprocess_errors
        );
    }
}

#[derive(Serialize)]
struct InstanceSummary<'a> {
    instance_id: &'a str,
    master: &'a str,
    slaves: Vec<&'a str>,
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let graph = StageGraph::from_json_file(&args.graph)?;
    graph.validate()?;

    let mut instances: Vec<InstanceSummary<'_>> = Vec::new();
    for stage in &graph.stages {
        let id = stage.instance_id();
        let position = match instances.iter().position(|i| i.instance_id == id) {
            Some(position) => position,
            None => {
                instances.push(InstanceSummary {
                    instance_id: id,
                    master: "",
                    slaves: Vec::new(),
                });
                instances.len() - 1
            }
        };
        let summary = &mut instances[position];
        if stage.model.is_some() {
            summary.master = &stage.name;
        } else {
            summary.slaves.push(&stage.name);
        }
    }

    if args.json {
        println!(
            "{{\"schema_version\":{},\"command\":\"validate\",\"ok\":true,\"graph_schema_version\":{},\"stages\":{},\"instances\":{}}}",
            JSON_SCHEMA_VERSION,
            GRAPH_SCHEMA_VERSION,
            graph.stages.len(),
            to_json(&instances)?
        );
    } else {
        println!(
            "graph OK: {} stage(s), {} model instance(s)",
            graph.stages.len(),
            instances.len()
        );
        for instance in &instances {
            println!(
                "  {}: master={} slaves=[{}]",
                instance.instance_id,
                instance.master,
                instance.slaves.join(", ")
            );
        }
    }
    Ok(())
}

fn run_template(args: TemplateArgs) -> Result<()> {
    let json = StageGraph::template().to_json_pretty()?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, format!("{json}\n")).map_err(|e| {
                EngineError::Pipeline(format!("Failed to write {}: {e}", path.display()))
            })?;
            tracing::info!(path = %path.display(), "Stage graph template written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Pipeline(format!("Failed to encode JSON output: {e}")))
}

fn run_json(report: &RunReport) -> Result<String> {
    Ok(format!(
        "{{\"schema_version\":{},\"command\":\"run\",\"ok\":true,\"report\":{}}}",
        JSON_SCHEMA_VERSION,
        to_json(report)?
    ))
}

fn json_string(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t");
    format!("\"{escaped}\"")
}

fn command_error_json(command: &str, error: &str) -> String {
    format!(
        "{{\"schema_version\":{},\"command\":{},\"ok\":false,\"error\":{}}}",
        JSON_SCHEMA_VERSION,
        json_string(command),
        json_string(error)
    )
}
