//! packet-bbs node daemon

mod beacon;
mod config;
mod shell;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast;

use packet_bbs_radio::{LinkEngine, LinkEvent};

use crate::beacon::Beacon;
use crate::config::NodeConfig;
use crate::shell::CommandShell;

#[derive(Debug, Parser)]
#[command(name = "packet-bbs", version, about = "Packet radio BBS over KISS TNCs")]
struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, env = "PACKET_BBS_CONFIG", default_value = "packet-bbs.toml")]
    config: PathBuf,

    /// Parse and validate the configuration, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;
    let channels = config
        .channels
        .iter()
        .map(|section| Ok((section.channel_config()?, section.build_transport())))
        .collect::<Result<Vec<_>>>()?;

    if cli.check {
        for (channel, transport) in &channels {
            println!(
                "{}: {} on {} port {}",
                channel.id,
                channel
                    .local_callsigns
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                transport.describe(),
                channel.kiss_port
            );
        }
        return Ok(());
    }

    let engine = Arc::new(LinkEngine::new());
    let shell = Arc::new(CommandShell::new(config.shell.banner.clone()));
    engine.applications().register_default(shell).await;

    tokio::spawn(log_events(engine.subscribe()));

    for (channel, transport) in channels {
        let id = channel.id.clone();
        info!("Starting channel {} on {}", id, transport.describe());
        engine
            .add_channel(channel, transport)
            .await
            .with_context(|| format!("starting channel {}", id))?;
    }

    let beacon = match &config.beacon {
        Some(b) => {
            let beacon = Beacon::new(engine.clone(), b.destination()?, b.text.clone(), b.interval());
            Some(tokio::spawn(beacon.run()))
        }
        None => None,
    };

    info!("packet-bbs running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(task) = beacon {
        task.abort();
    }
    engine.shutdown().await;
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<LinkEvent>) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Connected(key)) => info!("{} connected", key),
            Ok(LinkEvent::Disconnected { key, reason }) => info!("{} disconnected: {}", key, reason),
            Ok(LinkEvent::ConnectionFailed { key, reason }) => warn!("{} connection failed: {}", key, reason),
            Ok(LinkEvent::DeliveryFailed { key, seq }) => warn!("{} gave up on frame {}", key, seq),
            Ok(LinkEvent::ChannelHealth {
                channel,
                consecutive_failures,
            }) => error!("Channel {} failed {} writes in a row", channel, consecutive_failures),
            Ok(LinkEvent::FramingError { channel, error }) => warn!("Channel {}: {}", channel, error),
            Ok(LinkEvent::UnprotoReceived {
                channel,
                source,
                destination,
                payload,
            }) => info!(
                "{} {}>{}: {}",
                channel,
                source,
                destination,
                String::from_utf8_lossy(&payload).trim_end()
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Event log skipped {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
