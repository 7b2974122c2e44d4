//! Proximity alert - blinks an LED and buzzer faster as a BLE ranging sensor gets closer
//!
//! Module structure:
//! - `domain/` - Readings, alert targets, output pins
//! - `io/` - Sensor transport (BLE, replay) and output drivers (sysfs GPIO, logging)
//! - `services/` - Interval policy, alert driver, link supervisor
//! - `infra/` - Config, link statistics

use anyhow::Context;
use clap::{Parser, ValueEnum};
use proximity_alert::infra::{install_shutdown_handler, Config, LinkStats};
use proximity_alert::io::{BleConfig, BleTransport, LoggingOutput, OutputDriver, SysfsGpio};
use proximity_alert::services::{
    AlertDriver, AlertError, LinkSupervisor, SupervisorConfig, SupervisorError, SupervisorExit,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Proximity alert - BLE distance sensor to LED/buzzer blink rate
#[derive(Parser, Debug)]
#[command(name = "proximity-alert", version, about)]
struct Args {
    /// Sensor Bluetooth address (AA:BB:CC:DD:EE:FF)
    address: String,

    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Log output transitions instead of driving GPIO
    #[arg(long)]
    dry_run: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    // RUST_LOG overrides; default INFO, use RUST_LOG=debug for per-sample events
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit here, before anything touches hardware
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        git_hash = %env!("GIT_HASH"),
        "proximity-alert starting"
    );

    match run(args).await {
        Ok(exit) => {
            info!(exit = ?exit, "proximity-alert shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "proximity-alert failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<SupervisorExit> {
    // An explicit --config must load; otherwise fall back to defaults with a warning
    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load_from_path(&Config::resolve_config_path(None)),
    };
    info!(
        config_file = %config.config_file(),
        address = %args.address,
        led_pin = %config.led_pin(),
        buzzer_pin = %config.buzzer_pin(),
        gpio_root = %config.gpio_root(),
        reconnect = ?config.reconnect_policy(),
        backoff_ms = %config.reconnect_backoff().as_millis(),
        dry_run = %args.dry_run,
        "config_loaded"
    );

    // SIGINT and SIGTERM both run the teardown below
    let shutdown_rx = install_shutdown_handler().context("Failed to install signal handlers")?;

    let stats = Arc::new(LinkStats::new());
    spawn_stats_reporter(stats.clone(), config.metrics_interval_secs());

    let outcome = if args.dry_run {
        let (outcome, output) =
            supervise(LoggingOutput::new(), &args.address, &config, stats.clone(), shutdown_rx)
                .await;
        outcome.and_then(|exit| output.map(|_| exit).map_err(anyhow::Error::from))
    } else {
        let gpio = SysfsGpio::open(config.gpio_root(), config.led_pin(), config.buzzer_pin())
            .context("Failed to set up GPIO outputs")?;
        let (outcome, output) =
            supervise(gpio, &args.address, &config, stats.clone(), shutdown_rx).await;
        let released = match output {
            Ok(gpio) => gpio.release().context("Failed to release GPIO outputs"),
            Err(e) => Err(e.into()),
        };
        // A supervisor error is the more useful one to report
        match (outcome, released) {
            (Err(e), Err(release_err)) => {
                warn!(error = %format!("{release_err:#}"), "gpio_release_failed");
                Err(e)
            }
            (outcome, released) => released.and(outcome),
        }
    };

    stats.snapshot().log();
    outcome
}

/// Start the alert driver, run the link supervisor, then stop the driver.
///
/// Returns the supervisor outcome and the output driver handed back by the
/// stopped render thread, so the caller can release it.
async fn supervise<O: OutputDriver>(
    output: O,
    address: &str,
    config: &Config,
    stats: Arc<LinkStats>,
    shutdown_rx: watch::Receiver<bool>,
) -> (anyhow::Result<SupervisorExit>, Result<O, AlertError>) {
    let mut driver = AlertDriver::new(output, config.idle_poll());
    if let Err(e) = driver.start() {
        return (Err(e).context("Failed to start alert driver"), driver.into_output());
    }

    let transport = BleTransport::new(BleConfig {
        scan_timeout: config.scan_timeout(),
        connect_timeout: config.connect_timeout(),
    });
    let mut supervisor = LinkSupervisor::new(
        transport,
        driver.handle(),
        SupervisorConfig::new(address, config),
        stats,
    );

    let outcome = supervisor.run(shutdown_rx).await.map_err(|e| {
        if let SupervisorError::Connect(cause) | SupervisorError::Subscribe(cause) = &e {
            if cause.is_connect_error() {
                warn!(address = %address, "sensor_unreachable_check_power_and_range");
            }
        }
        anyhow::Error::new(e).context("Link supervision failed")
    });

    (outcome, driver.into_output())
}

fn spawn_stats_reporter(stats: Arc<LinkStats>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            stats.snapshot().log();
        }
    });
}
