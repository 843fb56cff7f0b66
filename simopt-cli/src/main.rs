mod config;

use crate::config::ExperimentFile;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simopt_core::progress::{progress_channel, DEFAULT_PROGRESS_CAPACITY};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Turn debugging information on
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment described by a JSON file.
    Run {
        /// Path to the experiment JSON.
        experiment: PathBuf,
        /// Override the file's worker count.
        #[arg(short, long)]
        parallelism: Option<usize>,
        /// Override the file's result-file prefix.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Suppress the JSON event stream on stdout.
        #[arg(short, long, default_value_t = false)]
        quiet: bool,
    },
}

/// Logs go to stderr; stdout is reserved for the JSON event stream.
fn setup_tracing(debug: bool) {
    let default_directives = if debug { "simopt=debug" } else { "simopt=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.debug);

    match &cli.command {
        Some(Commands::Run {
            experiment,
            parallelism,
            output,
            quiet,
        }) => run(experiment, *parallelism, output.clone(), *quiet),
        None => Ok(()),
    }
}

fn run(path: &Path, parallelism: Option<usize>, output: Option<PathBuf>, quiet: bool) -> Result<()> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("could not read experiment file `{}`", path.display()))?;
    let file: ExperimentFile = serde_json::from_str(&data)
        .with_context(|| format!("could not parse experiment file `{}`", path.display()))?;

    let experiment = file.into_experiment(parallelism, output)?;

    let (sender, receiver) = progress_channel(DEFAULT_PROGRESS_CAPACITY);

    // One consumer prints the event stream as JSON lines while the run is in
    // flight; this is the same wire form the HTTP boundary would stream.
    let printer = std::thread::spawn(move || {
        for event in receiver.iter() {
            if quiet {
                continue;
            }
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("could not serialise progress event: {e}"),
            }
        }
    });

    let results = experiment.run_with_progress(sender);
    printer.join().expect("event printer panicked");
    let results = results?;

    info!(
        "best objective after {} iteration(s): {:?}",
        results.iterations,
        results.best_kpis
    );
    println!("{}", serde_json::to_string_pretty(&results.summary())?);

    Ok(())
}
