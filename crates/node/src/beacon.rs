//! Periodic UI beacon from every channel's primary callsign.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use tokio::time::{interval, MissedTickBehavior};

use packet_bbs_core::Callsign;
use packet_bbs_radio::{DeliveryMode, LinkEngine};

pub struct Beacon {
    engine: Arc<LinkEngine>,
    destination: Callsign,
    text: Bytes,
    every: Duration,
}

impl Beacon {
    pub fn new(engine: Arc<LinkEngine>, destination: Callsign, text: impl Into<String>, every: Duration) -> Self {
        Self {
            engine,
            destination,
            text: Bytes::from(text.into()),
            every,
        }
    }

    /// Beacon now and then every interval, until the task is dropped.
    pub async fn run(self) {
        info!("Beacon to {} every {:?}", self.destination, self.every);
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.send_once().await;
        }
    }

    pub async fn send_once(&self) {
        for channel in self.engine.channel_ids().await {
            let source = match self.engine.primary_callsign(&channel).await {
                Ok(call) => call,
                Err(e) => {
                    warn!("No beacon on {}: {}", channel, e);
                    continue;
                }
            };
            if let Err(e) = self
                .engine
                .push(&channel, source, self.destination, self.text.clone(), DeliveryMode::FireAndForget)
                .await
            {
                warn!("Beacon on {} failed: {}", channel, e);
            }
        }
    }
}
