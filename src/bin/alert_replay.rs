//! Alert replay - runs the link supervisor and alert driver against a scripted sensor
//!
//! Exercises the full pipeline without a radio or GPIO: the script plays the sensor,
//! and the logging output driver reports every LED/buzzer transition.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --bin alert-replay -- config/replay/approach.txt

use anyhow::Context;
use clap::Parser;
use proximity_alert::infra::{install_shutdown_handler, Config, LinkStats};
use proximity_alert::io::{parse_script, LoggingOutput, ReplayTransport};
use proximity_alert::services::{AlertDriver, LinkSupervisor, SupervisorConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const REPLAY_ADDRESS: &str = "00:00:00:00:00:00";

/// Replay a sensor script through the alert pipeline
#[derive(Parser, Debug)]
#[command(name = "alert-replay", version, about)]
struct Args {
    /// Replay script (one step per line, `session` separates reconnects)
    script: String,

    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));
    let text = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read replay script {}", args.script))?;
    let sessions =
        parse_script(&text).with_context(|| format!("Invalid replay script {}", args.script))?;
    info!(script = %args.script, sessions = sessions.len(), "replay_loaded");

    let shutdown_rx = install_shutdown_handler().context("Failed to install signal handlers")?;

    let mut driver = AlertDriver::new(LoggingOutput::new(), config.idle_poll());
    driver.start().context("Failed to start alert driver")?;

    let transport = ReplayTransport::new(sessions);
    let probe = transport.probe();
    let stats = Arc::new(LinkStats::new());
    let mut supervisor = LinkSupervisor::new(
        transport,
        driver.handle(),
        SupervisorConfig::new(REPLAY_ADDRESS, &config),
        stats.clone(),
    );

    let outcome = supervisor.run(shutdown_rx).await;
    let output = driver.into_output();

    stats.snapshot().log();
    info!(
        connect_attempts = probe.connect_attempts(),
        closed_sessions = probe.closed_sessions(),
        "replay_finished"
    );

    let exit = outcome.context("Link supervision failed")?;
    output.context("Alert driver failed")?;
    info!(exit = ?exit, "alert-replay complete");
    Ok(())
}
