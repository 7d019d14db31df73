// ========================================================================================
//
//                      THE COMMAND-LINE DRIVER: AMETAPRED
//
// ========================================================================================
//
// Loads a run configuration, wires the file-backed collaborators into the step graph and
// asks the graph for one named artifact. Everything below the graph is the library's
// business; this file only resolves arguments, reports progress and maps errors to an
// exit code.

use ametapred::artifact::Artifact;
use ametapred::config::PipelineConfig;
use ametapred::export;
use ametapred::graph::{Params, ParamValue, TaskGraph};
use ametapred::pipeline::{self, Collaborators, steps};
use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

type CliResult = Result<(), Box<dyn Error + Send + Sync>>;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "ametapred",
    version,
    about = "Pathogenicity predictor aggregation and benchmarking",
    long_about = "Joins precomputed and remote pathogenicity predictions onto clinical samples \
                 and scores every predictor against the recorded outcome."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Path to the TOML run configuration
    #[arg(long, value_name = "TOML")]
    config: PathBuf,

    /// Directory for on-disk step memoization; overrides the configuration
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Binds a step input for this run, e.g. `--param revel_threshold=0.7`
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, ParamValue)>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one step and write its artifact as TSV
    #[command(about = "Run the pipeline up to a step (default: evaluate)")]
    Run {
        #[command(flatten)]
        run: RunArgs,

        /// Name of the step to produce
        #[arg(long, default_value = steps::EVALUATE)]
        step: String,

        /// Output file; the artifact goes to stdout when omitted
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// List the registered steps and their dependencies
    Steps,

    /// Evaluate and write the benchmarking-event JSON documents
    #[command(about = "Export the evaluation as benchmarking JSON documents")]
    Export {
        #[command(flatten)]
        run: RunArgs,

        /// Directory receiving the JSON files
        #[arg(long, value_name = "DIR")]
        out_dir: PathBuf,
    },

    /// Print the effective configuration, defaults included
    PrintConfig {
        /// Configuration to complete with defaults; prints the bare defaults when omitted
        #[arg(long, value_name = "TOML")]
        config: Option<PathBuf>,
    },
}

/// `name=value`; numeric values bind numeric inputs, anything else binds text.
fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing input name in '{raw}'"));
    }
    let value = match value.trim().parse::<f64>() {
        Ok(number) => ParamValue::Float(number),
        Err(_) => ParamValue::Text(value.to_string()),
    };
    Ok((name.to_string(), value))
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let start_time = Instant::now();

    let result = match Cli::parse().command {
        Commands::Run { run, step, output } => run_command(&run, &step, output.as_deref()),
        Commands::Steps => steps_command(),
        Commands::Export { run, out_dir } => export_command(&run, &out_dir),
        Commands::PrintConfig { config } => print_config_command(config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    eprintln!("> Done in {:.2?}.", start_time.elapsed());
}

/// Loads the configuration, applies command-line overrides and builds the graph.
fn prepare(run: &RunArgs) -> Result<(PipelineConfig, TaskGraph, Params), Box<dyn Error + Send + Sync>> {
    let mut config = PipelineConfig::load(&run.config)?;
    if let Some(dir) = &run.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    eprintln!("> Using configuration: {}", run.config.display());
    if let Some(dir) = &config.cache_dir {
        eprintln!("> Caching step artifacts under: {}", dir.display());
    }

    let collaborators = Collaborators::from_config(&config)?;
    let graph = pipeline::build_graph(&config, collaborators)?;

    let mut params = Params::new();
    for (name, value) in &run.params {
        eprintln!("> Binding input {name} = {value}");
        params.set(name, value.clone());
    }
    Ok((config, graph, params))
}

fn run_command(run: &RunArgs, step: &str, output: Option<&Path>) -> CliResult {
    let (_, mut graph, params) = prepare(run)?;
    eprintln!("> Plan: {}", graph.plan(step)?.join(" -> "));

    let artifact = graph.request(step, &params)?;
    match output {
        Some(path) => {
            artifact.write_to(path)?;
            eprintln!("> Wrote {} '{}' to {}", artifact.kind(), step, path.display());
        }
        None => write_stdout(&artifact)?,
    }
    Ok(())
}

fn write_stdout(artifact: &Artifact) -> CliResult {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    match artifact {
        Artifact::Table(table) => table.write_delimited(&mut out, b'\t')?,
        Artifact::List(items) => {
            for item in items {
                writeln!(out, "{item}")?;
            }
        }
        Artifact::Mapping(mapping) => {
            for (key, values) in mapping {
                writeln!(out, "{key}\t{}", values.join("|"))?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn steps_command() -> CliResult {
    let config = PipelineConfig::default();
    let graph = pipeline::build_graph(&config, Collaborators::empty())?;
    for step in graph.steps() {
        if step.deps().is_empty() {
            println!("{} ({})", step.name(), step.kind());
        } else {
            println!("{} ({}) <- {}", step.name(), step.kind(), step.deps().join(", "));
        }
    }
    Ok(())
}

fn export_command(run: &RunArgs, out_dir: &Path) -> CliResult {
    let (config, mut graph, params) = prepare(run)?;
    let evaluation = pipeline::evaluate(&mut graph, &params)?;
    eprintln!("> Evaluated {} predictors.", evaluation.scores.len());

    let written = export::write_all(&evaluation, &config.export, out_dir, chrono::Utc::now())?;
    eprintln!("> Wrote {} JSON files to {}", written.len(), out_dir.display());
    Ok(())
}

fn print_config_command(path: Option<&Path>) -> CliResult {
    let config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    print!("{}", config.to_toml_string()?);
    Ok(())
}
