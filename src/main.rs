use anyhow::{Context, Result};
use clap::Parser;
use port_relay::{
    FailureReport, Forwarder, config::DEFAULT_CONFIG_PATH, error_channel, load_config,
};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "port-relay", about = "Forward local TCP ports to fixed local destinations")]
struct Cli {
    /// Path to the forwarding rules (YAML, or TOML with a .toml extension)
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Capacity of the error reporting channel
    #[arg(long, value_name = "N", default_value_t = 64)]
    error_buffer: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    info!(
        config_file = %cli.config.display(),
        version = %config.version,
        rules = config.connections.len(),
        connect_timeout_ms = config.connect_timeout_ms,
        "Configuration loaded"
    );

    let (sink, mut reports) = error_channel(cli.error_buffer);
    let forwarder = Forwarder::from_config(&config, &sink).await;
    info!(
        active = forwarder.connections().len(),
        skipped = forwarder.skipped().len(),
        "Set up proxy connections"
    );
    if forwarder.connections().is_empty() {
        warn!("No forwarding rules are active");
    }

    let handle = forwarder.spawn();

    // `sink` stays alive here so the report loop only ends on Ctrl-C.
    loop {
        tokio::select! {
            Some(report) = reports.recv() => log_report(&report),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Shutting down");
                break;
            }
        }
    }

    handle.close();
    let join = handle.join();
    tokio::pin!(join);
    loop {
        tokio::select! {
            () = &mut join => break,
            Some(report) = reports.recv() => log_report(&report),
        }
    }
    Ok(())
}

/// Failures are already logged where they happen; this only traces the drain.
fn log_report(report: &FailureReport) {
    debug!(
        rule = %report.rule,
        severity = ?report.severity,
        error = %report.error,
        "Failure reported"
    );
}
