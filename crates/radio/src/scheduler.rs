//! Per-channel outbound queue and the paced transmit loop

use std::collections::VecDeque;
use std::sync::Arc;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::sleep;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use packet_bbs_core::Frame;

use crate::config::ChannelId;
use crate::directory::SessionKey;
use crate::event::LinkEvent;
use crate::kiss::{KissCodec, KissFrame};
use crate::transport::Transport;
use crate::LinkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Retried by the owning session until acknowledged.
    RequiresAck,
    FireAndForget,
}

/// A frame waiting for its transmit turn.
#[derive(Debug, Clone)]
pub struct DeliveryEntry {
    pub frame: Frame,
    pub mode: DeliveryMode,
    /// 0 for the first transmission.
    pub attempt: u32,
    pub owner: Option<SessionKey>,
    /// Gets the frame back once it has been written to the transport.
    pub on_air: Option<mpsc::UnboundedSender<Frame>>,
}

impl DeliveryEntry {
    pub fn unowned(frame: Frame, mode: DeliveryMode) -> Self {
        Self {
            frame,
            mode,
            attempt: 0,
            owner: None,
            on_air: None,
        }
    }

    fn report_on_air(&self) {
        if let Some(on_air) = &self.on_air {
            let _ = on_air.send(self.frame.clone());
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub transmitted: u64,
    pub turns: u64,
    pub write_failures: u64,
    /// FIRE_AND_FORGET frames shed while the channel was failing.
    pub dropped: u64,
}

/// FIFO of frames for one channel, shared between sessions and the scheduler.
#[derive(Clone, Default)]
pub struct DeliveryQueue {
    entries: Arc<Mutex<VecDeque<DeliveryEntry>>>,
    notify: Arc<Notify>,
    stats: Arc<Mutex<QueueStats>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. A retransmission of a frame that is still queued only
    /// updates the queued copy; returns false in that case.
    pub async fn enqueue(&self, entry: DeliveryEntry) -> bool {
        let mut entries = self.entries.lock().await;
        if entry.mode == DeliveryMode::RequiresAck {
            if let Some(queued) = entries
                .iter_mut()
                .find(|e| e.owner == entry.owner && e.frame == entry.frame)
            {
                queued.attempt = entry.attempt;
                if entry.on_air.is_some() {
                    queued.on_air = entry.on_air;
                }
                return false;
            }
        }
        entries.push_back(entry);
        drop(entries);
        self.stats.lock().await.queued += 1;
        self.notify.notify_one();
        true
    }

    /// Put entries back at the head, keeping their order.
    pub async fn push_front(&self, batch: Vec<DeliveryEntry>) {
        if batch.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().await;
        for entry in batch.into_iter().rev() {
            entries.push_front(entry);
        }
        self.notify.notify_one();
    }

    /// Remove up to `max` entries from the head.
    pub async fn take_turn(&self, max: usize) -> Vec<DeliveryEntry> {
        let mut entries = self.entries.lock().await;
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    /// Drop every queued entry matching `predicate`.
    pub async fn retract<F>(&self, predicate: F) -> usize
    where
        F: Fn(&DeliveryEntry) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| !predicate(e));
        before - entries.len()
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let n = entries.len();
        entries.clear();
        n
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn stats(&self) -> QueueStats {
        *self.stats.lock().await
    }

    pub async fn snapshot(&self) -> Vec<DeliveryEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    async fn wait(&self) {
        self.notify.notified().await
    }
}

/// Drains a [`DeliveryQueue`] onto a transport in paced turns.
///
/// Each turn sends at most `frames_per_turn` frames back to back, then the
/// channel stays quiet for `min_tx_pause`.
pub struct TransmitScheduler {
    channel: ChannelId,
    port: u8,
    config: LinkConfig,
    queue: DeliveryQueue,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<LinkEvent>,
    codec: KissCodec,
}

impl TransmitScheduler {
    pub fn new(
        channel: ChannelId,
        port: u8,
        config: LinkConfig,
        queue: DeliveryQueue,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        let codec = KissCodec::new(config.frame_size_max);
        Self {
            channel,
            port,
            config,
            queue,
            transport,
            events,
            codec,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Transmit scheduler for {} on {} started",
            self.channel,
            self.transport.describe()
        );
        let mut consecutive_failures = 0u32;

        loop {
            while self.queue.is_empty().await {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.queue.wait() => {}
                }
            }

            let mut batch = VecDeque::from(self.queue.take_turn(self.config.frames_per_turn).await);
            let mut sent = 0u64;
            let mut failed = false;
            let mut shed = 0usize;

            while let Some(entry) = batch.pop_front() {
                let Some(wire) = self.encode(&entry.frame) else {
                    // never sendable; the owner's retry timer gives up on it
                    entry.report_on_air();
                    continue;
                };
                match self.transport.write_bytes(&wire).await {
                    Ok(()) => {
                        sent += 1;
                        consecutive_failures = 0;
                        debug!("{} TX {} attempt {}", self.channel, entry.frame, entry.attempt);
                        entry.report_on_air();
                    }
                    Err(e) => {
                        failed = true;
                        consecutive_failures += 1;
                        warn!("{} write failed: {}", self.channel, e);
                        batch.push_front(entry);
                        break;
                    }
                }
            }

            if failed {
                self.queue.push_front(batch.into_iter().collect()).await;
                let threshold = self.config.health_failure_threshold;
                if consecutive_failures == threshold {
                    error!(
                        "{} has failed {} writes in a row",
                        self.channel, consecutive_failures
                    );
                    let _ = self.events.send(LinkEvent::ChannelHealth {
                        channel: self.channel.clone(),
                        consecutive_failures,
                    });
                }
                // Sessions resend what they need once the channel is back.
                if consecutive_failures >= threshold {
                    shed = self
                        .queue
                        .retract(|e| e.mode == DeliveryMode::FireAndForget)
                        .await;
                    if shed > 0 {
                        warn!("{} is down, dropped {} queued frames", self.channel, shed);
                    }
                }
            }

            {
                let mut stats = self.queue.stats.lock().await;
                stats.transmitted += sent;
                stats.turns += 1;
                stats.dropped += shed as u64;
                if failed {
                    stats.write_failures += 1;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(self.config.min_tx_pause) => {}
            }
        }
    }

    fn encode(&mut self, frame: &Frame) -> Option<BytesMut> {
        let data = match frame.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("{} dropping unencodable frame {}: {}", self.channel, frame, e);
                return None;
            }
        };
        let mut wire = BytesMut::with_capacity(data.len() + 8);
        match self.codec.encode(KissFrame::data(self.port, data), &mut wire) {
            Ok(()) => Some(wire),
            Err(e) => {
                error!("{} dropping frame {}: {}", self.channel, frame, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use packet_bbs_core::{Callsign, ProtocolId};
    use tokio::time::{Duration, Instant};
    use crate::simulated::{EtherConfig, SimulatedEther, SimulatedTransport};

    fn ui(text: &'static str) -> DeliveryEntry {
        let frame = Frame::unproto(
            "BEACON".parse::<Callsign>().unwrap(),
            "BBS".parse().unwrap(),
            ProtocolId::Text,
            Bytes::from_static(text.as_bytes()),
        );
        DeliveryEntry::unowned(frame, DeliveryMode::FireAndForget)
    }

    #[tokio::test]
    async fn test_queue_order_and_push_front() {
        let queue = DeliveryQueue::new();
        for t in ["a", "b", "c"] {
            queue.enqueue(ui(t)).await;
        }
        let turn = queue.take_turn(2).await;
        assert_eq!(turn.len(), 2);
        queue.push_front(turn).await;
        let all: Vec<_> = queue
            .take_turn(10)
            .await
            .into_iter()
            .map(|e| e.frame.payload)
            .collect();
        assert_eq!(all, vec!["a", "b", "c"]);
        assert_eq!(queue.stats().await.queued, 3);
    }

    #[tokio::test]
    async fn test_requeued_retransmission_is_not_duplicated() {
        let queue = DeliveryQueue::new();
        let mut entry = ui("again");
        entry.mode = DeliveryMode::RequiresAck;
        assert!(queue.enqueue(entry.clone()).await);
        entry.attempt = 1;
        assert!(!queue.enqueue(entry).await);
        let queued = queue.snapshot().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_are_paced() {
        let ether = SimulatedEther::new(EtherConfig {
            latency: Duration::ZERO,
            ..Default::default()
        });
        let transport = ether.transport("bbs");
        let (tx, _rx) = mpsc::channel(16);
        transport.connect(tx).await.unwrap();

        let mut config = LinkConfig::default();
        config.frames_per_turn = 2;
        let queue = DeliveryQueue::new();
        for t in ["1", "2", "3", "4", "5"] {
            queue.enqueue(ui(t)).await;
        }
        let (events, _) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let scheduler = TransmitScheduler::new(
            "vhf".into(),
            0,
            config.clone(),
            queue.clone(),
            transport.clone(),
            events,
        );
        let start = Instant::now();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        task.await.unwrap();

        let written = transport.written().await;
        assert_eq!(written.len(), 5);
        let times: Vec<_> = written.iter().map(|(t, _)| *t - start).collect();
        assert!(times[1] < config.min_tx_pause);
        assert!(times[2] >= config.min_tx_pause);
        assert!(times[4] >= config.min_tx_pause * 2);
        assert_eq!(queue.stats().await.turns, 3);
    }

    fn owned(text: &'static str, on_air: mpsc::UnboundedSender<Frame>) -> DeliveryEntry {
        let mut entry = ui(text);
        entry.mode = DeliveryMode::RequiresAck;
        entry.owner = Some(SessionKey::new(
            "vhf".into(),
            "BBS".parse().unwrap(),
            "N0CALL".parse().unwrap(),
        ));
        entry.on_air = Some(on_air);
        entry
    }

    struct Running {
        transport: Arc<SimulatedTransport>,
        events: broadcast::Receiver<LinkEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
        _inbound: mpsc::Receiver<Bytes>,
    }

    impl Running {
        async fn stop(self) -> Arc<SimulatedTransport> {
            self.cancel.cancel();
            self.task.await.unwrap();
            self.transport
        }
    }

    /// Scheduler over a lone station whose first `failures` writes fail.
    async fn start(config: &LinkConfig, queue: &DeliveryQueue, failures: u32) -> Running {
        let ether = SimulatedEther::new(EtherConfig::default());
        let transport = ether.transport("bbs");
        let (tx, inbound) = mpsc::channel(16);
        transport.connect(tx).await.unwrap();
        transport.fail_next_writes(failures);
        let (events, events_rx) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let scheduler = TransmitScheduler::new(
            "vhf".into(),
            0,
            config.clone(),
            queue.clone(),
            transport.clone(),
            events,
        );
        let task = tokio::spawn(scheduler.run(cancel.clone()));
        Running {
            transport,
            events: events_rx,
            cancel,
            task,
            _inbound: inbound,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_requeues_and_retries() {
        let config = LinkConfig::default();
        let queue = DeliveryQueue::new();
        queue.enqueue(ui("x")).await;
        queue.enqueue(ui("y")).await;
        let mut running = start(&config, &queue, 2).await;

        tokio::time::sleep(config.min_tx_pause * 4).await;
        assert!(running.events.try_recv().is_err());
        let transport = running.stop().await;

        let payloads: Vec<_> = transport
            .written()
            .await
            .into_iter()
            .map(|(_, b)| b)
            .collect();
        assert_eq!(payloads.len(), 2);
        let stats = queue.stats().await;
        assert_eq!(stats.write_failures, 2);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_channel_reports_and_sheds_unacknowledged_frames() {
        let config = LinkConfig::default();
        let queue = DeliveryQueue::new();
        let (on_air, mut aired) = mpsc::unbounded_channel();
        queue.enqueue(ui("x")).await;
        queue.enqueue(owned("y", on_air)).await;
        let mut running = start(&config, &queue, 3).await;

        match running.events.recv().await.unwrap() {
            LinkEvent::ChannelHealth { consecutive_failures, .. } => {
                assert_eq!(consecutive_failures, 3)
            }
            other => panic!("unexpected event {:?}", other),
        }
        // still down: beacons and acks queued meanwhile go too
        queue.enqueue(ui("z")).await;
        running.transport.fail_next_writes(1);
        tokio::time::sleep(config.min_tx_pause * 3).await;
        let transport = running.stop().await;

        let written = transport.written().await;
        assert_eq!(written.len(), 1);
        assert_eq!(aired.try_recv().unwrap().payload, "y");
        let stats = queue.stats().await;
        assert_eq!(stats.write_failures, 4);
        assert_eq!(stats.dropped, 2);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_air_notice_waits_for_the_write() {
        let mut config = LinkConfig::default();
        config.frames_per_turn = 1;
        let queue = DeliveryQueue::new();
        for t in ["1", "2", "3"] {
            queue.enqueue(ui(t)).await;
        }
        let (on_air, mut aired) = mpsc::unbounded_channel();
        let entry = owned("mine", on_air);
        queue.enqueue(entry.clone()).await;
        // a retransmission while the first copy waits is merged, not queued twice
        let mut retry = entry;
        retry.attempt = 1;
        assert!(!queue.enqueue(retry).await);

        let started = Instant::now();
        let running = start(&config, &queue, 0).await;

        tokio::time::sleep(config.min_tx_pause * 2).await;
        assert!(aired.try_recv().is_err());

        let frame = aired.recv().await.unwrap();
        assert_eq!(frame.payload, "mine");
        assert!(Instant::now() - started >= config.min_tx_pause * 3);
        let transport = running.stop().await;

        let written = transport.written().await;
        assert_eq!(written.len(), 4);
        assert!(aired.try_recv().is_err());
    }
}
