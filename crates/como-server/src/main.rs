//! Como server entry point.
//!
//! Starts the TCP server and publishes a few demo sources so observers have
//! something to watch.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use como_server::{ComoServer, ServerConfig, SourceRegistry};
use como_types::SourceType;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Como server - publishes live sources to connected observers
#[derive(Parser, Debug)]
#[command(name = "como-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (defaults to `~/.config/como/server.json`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Largest accepted frame in bytes, overrides the config file
    #[arg(long, value_name = "BYTES")]
    max_frame_size: Option<usize>,

    /// Frames buffered per observer, overrides the config file
    #[arg(long, value_name = "FRAMES")]
    outbound_buffer: Option<usize>,

    /// Seconds between demo source updates
    #[arg(long, value_name = "SECS", default_value_t = 1)]
    interval: u64,

    /// Do not publish the demo sources
    #[arg(long)]
    no_demo: bool,

    /// Also append logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

/// Log to stderr, and also to `log_file` when given.
///
/// The returned guard flushes the file writer and must live until exit.
fn setup_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("como={default_level}")));

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .with(filter)
            .init();
        return Ok(None);
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
    Ok(Some(guard))
}

/// File config with command line overrides applied
fn load_config(args: &Args) -> Result<ServerConfig> {
    let path = args.config.clone().or_else(ServerConfig::default_path);
    let mut config = match path {
        Some(path) => ServerConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(max_frame_size) = args.max_frame_size {
        config.max_frame_size = max_frame_size;
    }
    if let Some(outbound_buffer) = args.outbound_buffer {
        config.outbound_buffer = outbound_buffer;
    }

    config.validate().context("Invalid command line options")?;
    Ok(config)
}

/// One minute load average, 0 where it cannot be read
fn load_average() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next()?.parse().ok())
        .unwrap_or(0.0)
}

async fn run_demo(registry: SourceRegistry, interval: Duration) -> Result<()> {
    let started = Instant::now();

    let mut uptime = registry.create_source(
        SourceType::Int,
        "demo.uptime",
        "Uptime",
        0,
        "Seconds since the server started",
    )?;
    let mut load = registry.create_source(
        SourceType::Double,
        "demo.load",
        "LoadAverage",
        load_average(),
        "One minute load average",
    )?;
    let mut status = registry.create_source(
        SourceType::String,
        "demo.status",
        "Status",
        "starting",
        "Server status",
    )?;

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        uptime.set_int(i64::try_from(started.elapsed().as_secs()).unwrap_or(i64::MAX));
        load.set_double(load_average());
        status.set_string(format!("serving {} observers", registry.session_count()));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_file.as_deref())?;

    let config = load_config(&args)?;
    let registry = SourceRegistry::new();

    info!("Starting como server...");
    let server = ComoServer::bind(&config, registry.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    let demo = (!args.no_demo).then(|| {
        let registry = registry.clone();
        let interval = Duration::from_secs(args.interval.max(1));
        tokio::spawn(async move {
            if let Err(e) = run_demo(registry, interval).await {
                error!("Demo sources stopped: {:#}", e);
            }
        })
    });

    server
        .serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Some(demo) = demo {
        demo.abort();
    }

    info!("Como server stopped");
    Ok(())
}
