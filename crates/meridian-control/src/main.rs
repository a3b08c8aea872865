//! Meridian control worker binary.
//!
//! Runs the deployment controllers against the configured store.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meridian_control::{ControlConfig, ControlService};

/// Meridian control worker.
#[derive(Parser, Debug)]
#[command(name = "meridian-control")]
#[command(about = "Run the Meridian deployment controllers")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Tick every enabled controller once and exit.
    #[arg(long)]
    once: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "meridian_control=debug"
    } else {
        "meridian_control=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    info!("Meridian control worker starting");

    let config = match cli.config.as_deref() {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::load().unwrap_or_else(|e| {
            info!(error = %e, "failed to load config, using defaults");
            ControlConfig::default()
        }),
    };

    info!(
        store = ?config.store.backend,
        fleet = ?config.fleet.backend,
        notifications = ?config.notifications.backend,
        "configuration loaded"
    );

    let service = ControlService::new(config);

    if cli.once {
        for (controller, report) in service.run_once().await? {
            info!(
                controller,
                candidates = report.candidates,
                processed = report.processed,
                contended = report.contended,
                failed = report.failed,
                "tick complete"
            );
        }
        return Ok(());
    }

    service.run().await?;
    Ok(())
}
