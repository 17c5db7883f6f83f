//! Como observer CLI
//!
//! Connects to a como server and prints its sources:
//! - `watch`: stream every change as it happens
//! - `list`: print the current set of sources once

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use como_protocol::{CacheChange, ClientEvent, ComoClient, SourceCache};
use como_types::Source;
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Como observer CLI
#[derive(Parser)]
#[command(name = "como")]
#[command(about = "Como observer - watch live sources of an instrumented process")]
#[command(version)]
#[command(after_help = "\
Examples:
  como watch                      Stream source changes from 127.0.0.1:4242
  como watch --json               Same, one JSON object per line
  como watch --no-list            Only changes made after connecting
  como list                       Print every live source as a table
  como --addr 10.0.0.5:4242 list  Query another server
")]
struct Cli {
    /// Server address
    #[arg(long, global = true, value_name = "ADDR", default_value = "127.0.0.1:4242")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream source announcements and removals until interrupted
    Watch {
        /// Print one JSON object per event
        #[arg(long)]
        json: bool,

        /// Skip the initial request for the current sources
        #[arg(long)]
        no_list: bool,
    },

    /// Print the current sources and exit
    List {
        /// Print a JSON array instead of a table
        #[arg(long)]
        json: bool,

        /// Milliseconds without new answers before the list is considered complete
        #[arg(long, value_name = "MS", default_value_t = 300)]
        quiet_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("como=warn")),
        )
        .init();

    match cli.command {
        Commands::Watch { json, no_list } => run_watch(&cli.addr, json, no_list).await,
        Commands::List { json, quiet_ms } => {
            run_list(&cli.addr, json, Duration::from_millis(quiet_ms)).await
        }
    }
}

async fn connect(addr: &str) -> Result<ComoClient> {
    ComoClient::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}. Is the server running?"))
}

/// Stream events until the server goes away or Ctrl-C
async fn run_watch(addr: &str, json: bool, no_list: bool) -> Result<()> {
    let mut client = connect(addr).await?;
    debug!("Watching {}", client.peer_addr());

    if !no_list {
        client
            .request_source_list()
            .await
            .context("Failed to request source list")?;
    }

    let mut cache = SourceCache::new();
    loop {
        let event = tokio::select! {
            event = client.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                client.disconnect().await;
                return Ok(());
            }
        };
        let Some(event) = event else {
            return Ok(());
        };

        let change = cache.apply(&event);
        if let Some(line) = format_event(&event, change, json) {
            println!("{line}");
        }

        if let ClientEvent::Disconnected { reason } = event {
            match reason {
                Some(reason) => bail!("Connection lost: {reason}"),
                None => return Ok(()),
            }
        }
    }
}

/// Request the list and collect answers until the server goes quiet
async fn run_list(addr: &str, json: bool, quiet: Duration) -> Result<()> {
    let mut client = connect(addr).await?;
    client
        .request_source_list()
        .await
        .context("Failed to request source list")?;

    let mut cache = SourceCache::new();
    while let Ok(Some(event)) = tokio::time::timeout(quiet, client.recv()).await {
        match event {
            ClientEvent::Disconnected { reason: Some(reason) } => {
                bail!("Connection lost: {reason}")
            }
            ClientEvent::Disconnected { reason: None } => break,
            event => {
                cache.apply(&event);
            }
        }
    }
    client.disconnect().await;

    if json {
        let sources: Vec<&Source> = cache.iter().collect();
        println!("{}", serde_json::to_string_pretty(&sources)?);
    } else if cache.is_empty() {
        println!("No sources");
    } else {
        print!("{}", format_table(cache.iter()));
    }
    Ok(())
}

fn local_time(timestamp: DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%H:%M:%S%.3f")
        .to_string()
}

/// One output line per event, `None` for events not worth printing
fn format_event(event: &ClientEvent, change: CacheChange, json: bool) -> Option<String> {
    if json {
        let value = match event {
            ClientEvent::SourceUpdated(source) => json!({ "event": "updated", "source": source }),
            ClientEvent::SourceRemoved(source) => json!({ "event": "removed", "source": source }),
            ClientEvent::ListRequested => return None,
            ClientEvent::MessageDropped(e) => {
                json!({ "event": "dropped", "error": e.to_string() })
            }
            ClientEvent::Disconnected { reason } => {
                json!({ "event": "disconnected", "reason": reason })
            }
        };
        return Some(value.to_string());
    }

    match (event, change) {
        (ClientEvent::SourceUpdated(_), CacheChange::Unchanged) => None,
        (ClientEvent::SourceUpdated(source), _) => Some(format!(
            "{} {} ({}) = {}",
            local_time(source.timestamp()),
            source.name(),
            source.type_name(),
            source.value()
        )),
        (ClientEvent::SourceRemoved(source), _) => Some(format!(
            "{} {} removed",
            local_time(Utc::now()),
            source.name()
        )),
        (ClientEvent::MessageDropped(e), _) => Some(format!("Dropped message: {e}")),
        (ClientEvent::Disconnected { reason: None }, _) => Some("Disconnected".to_string()),
        (ClientEvent::ListRequested | ClientEvent::Disconnected { .. }, _) => None,
    }
}

/// Aligned table of sources with a header row
fn format_table<'a>(sources: impl Iterator<Item = &'a Source>) -> String {
    const HEADERS: [&str; 5] = ["NAME", "TYPE", "VALUE", "UPDATED", "DESCRIPTION"];

    let rows: Vec<[String; 5]> = sources
        .map(|s| {
            [
                s.name().to_string(),
                s.source_type().to_string(),
                s.value().to_string(),
                local_time(s.timestamp()),
                s.description().to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header = HEADERS.map(str::to_string);
    for row in std::iter::once(&header).chain(&rows) {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    }
    out
}
