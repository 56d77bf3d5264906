use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use pnet::datalink::{self, Channel, NetworkInterface};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use icsmap::config::EngineConfig;
use icsmap::pipeline::{PacketPipeline, PipelineSummary, RawFrame};
use icsmap::{AnalysisError, NetworkModel};

#[derive(Parser, Debug)]
#[command(
    name = "icsmap",
    version,
    about = "Industrial network topology mapper",
    long_about = "Captures traffic on an interface, identifies industrial protocols and \
                  devices, and maps every asset onto the Purdue reference model."
)]
struct Cli {
    /// Interface to capture on
    #[arg(short, long)]
    interface: Option<String>,

    /// Number of packet workers (defaults to the CPU count)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Fast mode: skip lookups, narrow worker and cache sizing
    #[arg(long)]
    fast: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stop capturing after this many seconds (default: run until Ctrl-C)
    #[arg(short, long)]
    duration: Option<u64>,

    /// List capture interfaces and exit
    #[arg(long)]
    list_interfaces: bool,
}

#[derive(Serialize)]
struct Report {
    generated_at: chrono::DateTime<Utc>,
    interface: String,
    model: NetworkModel,
    summary: PipelineSummary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.list_interfaces {
        for iface in datalink::interfaces() {
            let addrs: Vec<String> = iface.ips.iter().map(|ip| ip.to_string()).collect();
            println!("{}\t{}", iface.name, addrs.join(", "));
        }
        return Ok(());
    }

    let interface_name = cli
        .interface
        .clone()
        .context("an interface is required (see --list-interfaces)")?;

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    if cli.fast {
        config = config.with_fast_mode();
    }
    config.validate()?;

    let interface = find_interface(&interface_name)?;
    let pipeline = PacketPipeline::start(config)?;

    let stop = Arc::new(AtomicBool::new(false));
    let capture = {
        let sender = pipeline.sender();
        let stop = Arc::clone(&stop);
        let interface = interface.clone();
        tokio::task::spawn_blocking(move || capture_loop(interface, sender, stop))
    };

    log::info!("capturing on {} (Ctrl-C to stop)", interface_name);
    match cli.duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    log::info!("capture duration elapsed");
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("interrupted, shutting down");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            log::info!("interrupted, shutting down");
        }
    }

    stop.store(true, Ordering::Relaxed);
    capture.await?.context("capture thread failed")?;

    let (model, summary) = pipeline.drain().await?;
    let report = Report {
        generated_at: Utc::now(),
        interface: interface_name,
        model,
        summary,
    };

    let json = serde_json::to_string_pretty(&report)?;
    match &cli.output {
        Some(path) => {
            std::fs::write(path, json).map_err(|e| {
                AnalysisError::OutputError(format!("writing report to {}: {}", path.display(), e))
            })?;
            log::info!("report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn find_interface(name: &str) -> anyhow::Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .with_context(|| format!("no such interface: {}", name))
}

/// Blocking capture loop, run on a dedicated thread. A short read timeout
/// keeps the stop flag responsive on quiet links.
fn capture_loop(
    interface: NetworkInterface,
    sender: tokio::sync::mpsc::Sender<RawFrame>,
    stop: Arc<AtomicBool>,
) -> icsmap::Result<()> {
    let capture_config = datalink::Config {
        read_timeout: Some(Duration::from_millis(500)),
        ..Default::default()
    };
    let mut rx = match datalink::channel(&interface, capture_config) {
        Ok(Channel::Ethernet(_, rx)) => rx,
        Ok(_) => {
            return Err(AnalysisError::CaptureError(format!(
                "unsupported channel type on {}",
                interface.name
            )))
        }
        Err(e) => {
            return Err(AnalysisError::CaptureError(format!(
                "opening capture on {}: {}",
                interface.name, e
            )))
        }
    };

    while !stop.load(Ordering::Relaxed) {
        match rx.next() {
            Ok(frame) => {
                if sender.blocking_send(RawFrame::new(frame.to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(AnalysisError::CaptureError(format!(
                    "capture error on {}: {}",
                    interface.name, e
                )))
            }
        }
    }
    Ok(())
}
