use std::process;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mqttlet::telemetry::{self, BusLogLayer, LogRecord};
use mqttlet::{Adapter, AdapterConfig, Mode, ShutdownReason, VersionInfo};

const USAGE: &str = "Usage: mqtt-service-adapter [--mode process|bridge]";

struct Args {
    mode: Option<Mode>,
}

enum Parsed {
    Run(Args),
    Help,
    Version,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(Parsed::Run(args)) => args,
        Ok(Parsed::Help) => {
            print_usage();
            return;
        }
        Ok(Parsed::Version) => {
            println!("mqtt-service-adapter {}", mqttlet::MQTTLET_VERSION);
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            print_usage();
            process::exit(2);
        }
    };

    let (bus_layer, bus_logs) = telemetry::bus_log_layer();
    init_tracing(bus_layer);

    match run(args, bus_logs).await {
        Ok(reason) => info!(%reason, "Exiting"),
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Adapter failed to start");
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("{USAGE}");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --mode <mode>    Operating mode: process or bridge [default: $ADAPTER_MODE or process]");
    eprintln!("  --version        Print version and exit");
    eprintln!("  -h, --help       Print this help");
    eprintln!();
    eprintln!("Configuration is read from the environment (SERVICE_NAME, NAMESPACE,");
    eprintln!("MQTT_LISTENER_URL, MQTT_PUBLISHER_URL, SERVICE_PROCESSOR, SUBSCRIPTIONS, ...).");
}

fn parse_args(args: &[String]) -> Result<Parsed, String> {
    let mut mode = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--mode" => {
                i += 1;
                let value = args.get(i).ok_or("--mode requires a value")?;
                mode = Some(value.parse::<Mode>().map_err(|e| e.to_string())?);
            }
            "--help" | "-h" => return Ok(Parsed::Help),
            "--version" | "-V" => return Ok(Parsed::Version),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Parsed::Run(Args { mode }))
}

async fn run(
    args: Args,
    bus_logs: mpsc::UnboundedReceiver<LogRecord>,
) -> anyhow::Result<ShutdownReason> {
    let mut config = AdapterConfig::from_env().context("invalid configuration")?;
    if let Some(mode) = args.mode {
        config = config.with_mode(mode);
    }

    let version = VersionInfo::new()
        .with_service(config.service_name.clone())
        .with_mode(config.mode.as_str());
    if let Ok(json) = serde_json::to_string(&version) {
        info!(version = %json, "mqtt-service-adapter starting");
    }

    let adapter = Adapter::start(config)
        .context("failed to start adapter")?
        .with_bus_logs(bus_logs);
    Ok(adapter.run(shutdown_signal()).await)
}

/// First set variable among `vars` that parses as a level, else `default`.
fn level_from_env(vars: &[&str], default: LevelFilter) -> LevelFilter {
    vars.iter()
        .find_map(|var| {
            std::env::var(var)
                .ok()
                .and_then(|raw| telemetry::parse_level(&raw))
        })
        .unwrap_or(default)
}

/// Initialize tracing with LOG_LEVEL_* and LOG_FORMAT support.
///
/// Console output honours RUST_LOG when set. Bus forwarding only ever sees the
/// adapter's own targets.
fn init_tracing(bus_layer: BusLogLayer) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from_env(&["LOG_LEVEL_CONSOLE", "LOG_LEVEL"], LevelFilter::INFO);
        EnvFilter::new(format!("mqttlet={level},mqtt_service_adapter={level}"))
    };

    let bus_level = level_from_env(&["LOG_LEVEL_MQTT", "LOG_LEVEL"], telemetry::DEFAULT_BUS_LEVEL);
    let bus_targets = Targets::new()
        .with_target("mqttlet", bus_level)
        .with_target("mqtt_service_adapter", bus_level);

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .with(bus_layer.with_filter(bus_targets));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
            .with(bus_layer.with_filter(bus_targets));
        let _ = subscriber.try_init();
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// runtime is misconfigured. That should fail fast at startup.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
