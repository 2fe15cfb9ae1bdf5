use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use graph_mil::{
    config::Config,
    observability::{self, Telemetry},
    pipeline::{run_edges, run_training},
};

/// Graph-propagated multiple-instance learning over whole-slide feature bags.
///
/// Run settings come from `MIL_*` environment variables.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Write the Prometheus text exposition of the run's metrics here on exit
    #[arg(long, env = "MIL_METRICS_OUT", global = true)]
    metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Build instance graphs for every manifest bag and write them as edge files
    Edges,
    /// Train and evaluate, keeping the best checkpoint
    Train,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::tracing::init().context("failed to initialize tracing")?;
    std::panic::set_hook(Box::new(|panic_info| {
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic_info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic payload");
        match panic_info.location() {
            Some(location) => error!(
                file = location.file(),
                line = location.line(),
                message,
                "panic occurred"
            ),
            None => error!(message, "panic occurred without location information"),
        }
    }));

    let config = Config::from_env().context("failed to load configuration")?;
    let telemetry = Telemetry::new().context("failed to register metrics")?;

    let result = match cli.command {
        Command::Edges => run_edges(&config, &telemetry).map(|summary| {
            info!(
                bags = summary.bags,
                files_written = summary.files_written,
                skipped = summary.skipped,
                "edges command finished"
            );
        }),
        Command::Train => run_training(&config, telemetry.clone()).map(|summary| {
            info!(
                epochs = summary.epochs.len(),
                best_score = summary.best_score,
                "train command finished"
            );
        }),
    };

    if let Some(path) = &cli.metrics_out {
        std::fs::write(path, telemetry.render_prometheus())
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }
    result
}
