use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

mod archive;
mod config;
mod editing;
mod error;
mod generation;
mod models;
mod output;
mod runner;
mod synthesis;
mod task;

use crate::config::{Config, TaskKind};
use crate::editing::EditingRtc;
use crate::generation::OpenAiCompletionFactory;
use crate::runner::{Runner, RunnerOptions, RunSummary};
use crate::synthesis::SynthesisRtc;
use crate::task::RtcTask;

/// Round-trip correctness sampling - sample forward and backward
/// generations for every datapoint in an archive
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    run_file: PathBuf,

    /// Verbose output - log each request and branch failure
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::from_file(&args.run_file)?;
    let summary = match config.task.kind {
        TaskKind::Synthesis => run_task(SynthesisRtc::new(&config.task)?, &config).await?,
        TaskKind::Editing => run_task(EditingRtc::new(&config.task)?, &config).await?,
    };

    output::print_summary(&summary);
    Ok(())
}

async fn run_task<T: RtcTask>(task: T, config: &Config) -> anyhow::Result<RunSummary> {
    let forward =
        OpenAiCompletionFactory::new(&config.forward, &config.task.example_separator)?;
    let backward =
        OpenAiCompletionFactory::new(&config.backward, &config.task.example_separator)?;
    let runner = Runner::new(
        task,
        Arc::new(forward),
        Arc::new(backward),
        RunnerOptions::from_config(config),
    );
    runner
        .run(
            Path::new(&config.input_data_path),
            Path::new(&config.output_data_path),
            config.html_output_path.as_deref().map(Path::new),
        )
        .await
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
