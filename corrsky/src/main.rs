//! Command-line entry point.
//!
//! Usage: `corrsky <config-file> [KEY: value]...` — trailing arguments
//! override config-file keys. Exit code 0 on success (including a
//! deliberate `EXIT_AT` early stop), non-zero on any fatal condition.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use corrsky::{pipeline, Config, Diagnostics};

#[derive(Parser, Debug)]
#[command(version, about = "Correlated lognormal full-sky field simulator")]
struct Args {
    /// Path to the KEY: value configuration file
    config: PathBuf,

    /// Number of worker threads (defaults to the number of cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Configuration overrides of the form `KEY: value` or `KEY=value`
    #[arg(value_name = "OVERRIDE", trailing_var_arg = true)]
    overrides: Vec<String>,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    if let Some(threads) = args.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            tracing::error!("cannot build thread pool: {e}");
            return ExitCode::FAILURE;
        }
    }

    let diag = Diagnostics::new();
    let cfg = match Config::load(&args.config, &args.overrides, &diag) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match pipeline::run(&cfg, &diag) {
        Ok(outcome) => {
            if let Some(stage) = &outcome.early_exit {
                tracing::info!("stopped after {stage} as requested");
            }
            tracing::info!("total number of warnings: {}", outcome.warnings);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e}");
            tracing::info!("total number of warnings: {}", diag.warnings());
            ExitCode::FAILURE
        }
    }
}
