use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gwmp_bridge::config::Config;
use gwmp_bridge::stats::Collector;
use gwmp_bridge::udp::registry::Callbacks;
use gwmp_bridge::udp::{Backend, Events};

/// How often the stats snapshot is exported
const STATS_EXPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "gwmp-bridge")]
#[command(about = "Bridge between Semtech UDP packet-forwarder gateways and a network server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("gwmp-bridge v{}", env!("CARGO_PKG_VERSION"));

    let callbacks = Callbacks {
        on_new: Some(Box::new(|gateway_id| {
            info!("Gateway {} connected", gateway_id);
            Ok(())
        })),
        on_delete: Some(Box::new(|gateway_id| {
            info!("Gateway {} timed out, removing session", gateway_id);
            Ok(())
        })),
    };

    let (backend, events) = Backend::start(&config, callbacks).await?;
    let Events {
        mut uplinks,
        mut stats,
        mut tx_acks,
    } = events;
    let collector = Arc::new(Collector::new());

    // Uplink consumer: log and feed the stats collector
    let uplink_collector = collector.clone();
    tokio::spawn(async move {
        while let Some(frame) = uplinks.recv().await {
            info!(
                "Uplink from gateway {}: freq={} Hz, rssi={} dBm, {} bytes",
                frame.rx_info.gateway_id,
                frame.tx_info.frequency,
                frame.rx_info.rssi,
                frame.phy_payload.len()
            );
            uplink_collector.record_uplink(&frame);
        }
    });

    // Gateway status consumer
    tokio::spawn(async move {
        while let Some(status) = stats.recv().await {
            info!(
                "Status from gateway {}: rx={}/{} ok, tx={}, ack rate {:.1}%",
                status.gateway_id,
                status.rx_packets_received_ok,
                status.rx_packets_received,
                status.tx_packets_emitted,
                status.ack_rate
            );
        }
    });

    // Downlink acknowledgement consumer. Correlating acks with their sent
    // batches is the network server's job; here they are only logged.
    tokio::spawn(async move {
        while let Some(ack) = tx_acks.recv().await {
            for item in &ack.items {
                info!(
                    "Tx-ack from gateway {} (token: 0x{:04x}): {}",
                    ack.gateway_id, ack.downlink_id, item.status
                );
            }
        }
    });

    // Periodic telemetry export
    let export_collector = collector.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_EXPORT_INTERVAL);
        ticker.tick().await; // discard the immediate first tick
        loop {
            ticker.tick().await;
            let snapshot = export_collector.export_and_reset();
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!("Stats export: {}", json),
                Err(e) => warn!("Failed to serialize stats snapshot: {}", e),
            }
        }
    });

    info!("Bridge running. Press Ctrl+C to stop.");
    let died = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutting down...");
            false
        }
        _ = backend.closed() => {
            error!("Transport engine terminated unexpectedly");
            true
        }
    };
    backend.stop().await;

    if died {
        anyhow::bail!("transport engine terminated unexpectedly");
    }
    Ok(())
}
