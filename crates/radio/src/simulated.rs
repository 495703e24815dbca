//! Simulated radio channel for testing

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};

use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct EtherConfig {
    pub packet_loss: f32,
    pub latency: Duration,
}

impl Default for EtherConfig {
    fn default() -> Self {
        Self {
            packet_loss: 0.0,
            latency: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EtherStats {
    pub writes: u64,
    pub dropped: u64,
    pub delivered: u64,
}

/// A shared medium: every write by one station reaches all others.
#[derive(Clone)]
pub struct SimulatedEther {
    inner: Arc<EtherInner>,
}

struct EtherInner {
    config: EtherConfig,
    stations: Mutex<Vec<Station>>,
    stats: Mutex<EtherStats>,
}

struct Station {
    id: usize,
    air: mpsc::UnboundedSender<(Instant, Bytes)>,
}

impl SimulatedEther {
    pub fn new(config: EtherConfig) -> Self {
        Self {
            inner: Arc::new(EtherInner {
                config,
                stations: Mutex::new(Vec::new()),
                stats: Mutex::new(EtherStats::default()),
            }),
        }
    }

    /// A transport attached to this ether. Nothing is heard until it connects.
    pub fn transport(&self, name: &str) -> Arc<SimulatedTransport> {
        static NEXT_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        Arc::new(SimulatedTransport {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            ether: self.clone(),
            connected: AtomicBool::new(false),
            fail_writes: AtomicU32::new(0),
            lose_writes: AtomicU32::new(0),
            written: Mutex::new(Vec::new()),
        })
    }

    pub async fn stats(&self) -> EtherStats {
        *self.inner.stats.lock().await
    }

    fn lost_in_air(&self) -> bool {
        let base_loss = self.inner.config.packet_loss as f64;
        if base_loss <= 0.0 {
            return false;
        }
        let mut rng = rand::rng();
        let r: f64 = rng.random();
        // bursty loss: mostly near the base rate, occasionally much worse
        let dynamic_factor = if r < 0.7 {
            0.8 + (r / 0.7) * 0.4
        } else if r < 0.95 {
            1.2 + ((r - 0.7) / 0.25) * 0.6
        } else {
            2.0 + ((r - 0.95) / 0.05) * 1.0
        };
        rng.random::<f64>() < base_loss * dynamic_factor
    }

    async fn attach(&self, id: usize, inbound: mpsc::Sender<Bytes>) {
        let (air_tx, mut air_rx) = mpsc::unbounded_channel::<(Instant, Bytes)>();
        // in-order delivery after the configured latency
        tokio::spawn(async move {
            while let Some((deliver_at, data)) = air_rx.recv().await {
                sleep_until(deliver_at).await;
                if inbound.send(data).await.is_err() {
                    break;
                }
            }
        });
        let mut stations = self.inner.stations.lock().await;
        stations.retain(|s| s.id != id);
        stations.push(Station { id, air: air_tx });
    }

    async fn detach(&self, id: usize) {
        self.inner.stations.lock().await.retain(|s| s.id != id);
    }

    async fn broadcast(&self, from: usize, data: &[u8], lost: bool) {
        let mut stats = self.inner.stats.lock().await;
        stats.writes += 1;
        if lost || self.lost_in_air() {
            stats.dropped += 1;
            debug!("Simulated loss of {} bytes from station {}", data.len(), from);
            return;
        }
        let deliver_at = Instant::now() + self.inner.config.latency;
        let payload = Bytes::copy_from_slice(data);
        let stations = self.inner.stations.lock().await;
        for station in stations.iter().filter(|s| s.id != from) {
            if station.air.send((deliver_at, payload.clone())).is_ok() {
                stats.delivered += 1;
            }
        }
    }
}

/// One station's transport on a [`SimulatedEther`].
pub struct SimulatedTransport {
    id: usize,
    name: String,
    ether: SimulatedEther,
    connected: AtomicBool,
    fail_writes: AtomicU32,
    lose_writes: AtomicU32,
    written: Mutex<Vec<(Instant, Bytes)>>,
}

impl SimulatedTransport {
    /// Make the next `n` writes fail at the transport boundary.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// The next `n` successful writes go on air but nobody hears them.
    pub fn lose_next_writes(&self, n: u32) {
        self.lose_writes.store(n, Ordering::SeqCst);
    }

    /// Every successful write with its timestamp.
    pub async fn written(&self) -> Vec<(Instant, Bytes)> {
        self.written.lock().await.clone()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError> {
        self.ether.attach(self.id, inbound).await;
        self.connected.store(true, Ordering::SeqCst);
        debug!("Simulated transport {} attached", self.name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.ether.detach(self.id).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if take_one(&self.fail_writes) {
            return Err(TransportError::WriteFailure("injected failure".into()));
        }
        trace!("{} writes {} bytes", self.name, data.len());
        self.written
            .lock()
            .await
            .push((Instant::now(), Bytes::copy_from_slice(data)));
        let lost = take_one(&self.lose_writes);
        self.ether.broadcast(self.id, data, lost).await;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated:{}", self.name)
    }
}
