//! Simulation scenarios for BBS links over a lossy shared channel

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};

use packet_bbs_core::Callsign;
use packet_bbs_radio::{
    Application, ChannelConfig, ChannelId, DeliveryMode, DisconnectReason, EtherStats, LinkEngine,
    LinkEvent, QueueStats, Response, SessionContext, SimulatedEther,
};

use crate::Conditions;

const CHANNEL: &str = "sim";
const BBS: &str = "BBS";
const USER: &str = "N0CALL-1";
const BEACON: &str = "BEACON";

/// Outcome of one connected-mode transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub sent: usize,
    pub delivered: usize,
    pub in_order: bool,
    pub payload_bytes: usize,
    pub elapsed: Duration,
    pub closed: Option<DisconnectReason>,
    pub ether: EtherStats,
    pub client_queue: QueueStats,
    pub server_queue: QueueStats,
}

impl TransferReport {
    pub fn completed(&self) -> bool {
        self.delivered == self.sent && self.in_order
    }

    /// Application bytes per second of simulated time.
    pub fn goodput_bps(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        (self.payload_bytes * 8) as f64 / self.elapsed.as_secs_f64()
    }
}

/// Outcome of a burst of UI beacons.
#[derive(Debug, Clone)]
pub struct BeaconReport {
    pub sent: usize,
    pub heard: usize,
    pub ether: EtherStats,
}

/// Records every message it receives.
struct Sink {
    received: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Application for Sink {
    fn name(&self) -> &str {
        "sink"
    }

    async fn handle_received_message(&self, _ctx: &SessionContext, payload: Bytes) -> Response {
        let _ = self.received.send(payload);
        Response::Nothing
    }
}

struct Stations {
    ether: SimulatedEther,
    server: LinkEngine,
    client: LinkEngine,
    channel: ChannelId,
    bbs: Callsign,
    user: Callsign,
}

impl Stations {
    async fn start(conditions: &Conditions) -> Result<Self> {
        let ether = SimulatedEther::new(conditions.ether.clone());
        let bbs: Callsign = BBS.parse()?;
        let user: Callsign = USER.parse()?;

        let server = LinkEngine::new();
        let mut config = ChannelConfig::new(CHANNEL, vec![bbs]);
        config.link = conditions.link.clone();
        server
            .add_channel(config, ether.transport("bbs"))
            .await
            .context("starting BBS station")?;

        let client = LinkEngine::new();
        let mut config = ChannelConfig::new(CHANNEL, vec![user]);
        config.link = conditions.link.clone();
        client
            .add_channel(config, ether.transport("user"))
            .await
            .context("starting user station")?;

        Ok(Self {
            ether,
            server,
            client,
            channel: ChannelId::new(CHANNEL),
            bbs,
            user,
        })
    }

    async fn stop(self) {
        self.client.shutdown().await;
        self.server.shutdown().await;
    }
}

/// Connect to the BBS, send `messages` bulletins of `size` bytes and wait
/// until all of them arrived or `budget` of simulated time ran out.
pub async fn mailbox_transfer(
    conditions: &Conditions,
    messages: usize,
    size: usize,
    budget: Duration,
) -> Result<TransferReport> {
    let stations = Stations::start(conditions).await?;
    let (received, mut inbox) = mpsc::unbounded_channel();
    stations
        .server
        .applications()
        .register_default(Arc::new(Sink { received }))
        .await;

    let start = Instant::now();
    let deadline = start + budget;

    let session = stations
        .client
        .connect(&stations.channel, stations.user, stations.bbs)
        .await?;
    tokio::select! {
        connected = session.wait_connected() => connected.context("connecting to BBS")?,
        _ = sleep_until(deadline) => bail!("no connection within {:?}", budget),
    }
    info!("Connected after {:?}", start.elapsed());

    let bulletins: Vec<Bytes> = (0..messages).map(|i| bulletin(i, size)).collect();
    for b in &bulletins {
        session.send(b.clone()).await?;
    }

    let mut got = Vec::with_capacity(messages);
    let mut closed = None;
    while got.len() < messages {
        tokio::select! {
            payload = inbox.recv() => match payload {
                Some(p) => {
                    debug!("Bulletin {} arrived after {:?}", got.len(), start.elapsed());
                    got.push(p);
                }
                None => break,
            },
            reason = session.wait_closed() => {
                closed = Some(reason);
                break;
            }
            _ = sleep_until(deadline) => break,
        }
    }
    let elapsed = start.elapsed();

    if closed.is_none() {
        session.disconnect_after_delivery().await.ok();
        tokio::select! {
            reason = session.wait_closed() => closed = Some(reason),
            _ = sleep_until(Instant::now() + budget) => {}
        }
    }

    let report = TransferReport {
        sent: messages,
        delivered: got.len(),
        in_order: got.iter().zip(bulletins.iter()).all(|(a, b)| a == b),
        payload_bytes: got.iter().map(|p| p.len()).sum(),
        elapsed,
        closed,
        ether: stations.ether.stats().await,
        client_queue: stations.client.queue_stats(&stations.channel).await?,
        server_queue: stations.server.queue_stats(&stations.channel).await?,
    };
    stations.stop().await;
    Ok(report)
}

/// Send `count` UI beacons and count how many the BBS heard.
pub async fn beacon_burst(conditions: &Conditions, count: usize) -> Result<BeaconReport> {
    let stations = Stations::start(conditions).await?;
    let mut events = stations.server.subscribe();
    let beacon: Callsign = BEACON.parse()?;

    for i in 0..count {
        stations
            .client
            .push(
                &stations.channel,
                stations.user,
                beacon,
                Bytes::from(format!("{} beacon {}", USER, i)),
                DeliveryMode::FireAndForget,
            )
            .await?;
    }

    // every frame has either landed or been lost once the queue drained
    let turns = count.div_ceil(conditions.link.frames_per_turn.max(1)) as u32;
    let settle = conditions.ether.latency * 2 + conditions.link.min_tx_pause * (turns + 1);
    let deadline = Instant::now() + settle;
    let mut heard = 0;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::UnprotoReceived { destination, .. }) if destination == beacon => heard += 1,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} events", n),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = sleep_until(deadline) => break,
        }
    }

    let report = BeaconReport {
        sent: count,
        heard,
        ether: stations.ether.stats().await,
    };
    stations.stop().await;
    Ok(report)
}

fn bulletin(index: usize, size: usize) -> Bytes {
    let header = format!("#{:04} ", index);
    let mut body = header.into_bytes();
    let fill = b"CQ CQ DE N0CALL ";
    while body.len() < size {
        body.push(fill[body.len() % fill.len()]);
    }
    body.truncate(size.max(6));
    Bytes::from(body)
}
