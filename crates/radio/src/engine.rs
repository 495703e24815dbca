//! Channel wiring: transports, read loops, schedulers and the public engine API.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use packet_bbs_core::{Callsign, Frame};

use crate::app::ApplicationRegistry;
use crate::config::{ChannelConfig, ChannelId};
use crate::directory::{SessionDirectory, SessionKey};
use crate::event::LinkEvent;
use crate::kiss::{KissCodec, KissCommand, KissFrame};
use crate::link::{spawn_session, SessionHandle};
use crate::scheduler::{DeliveryMode, DeliveryQueue, QueueStats, TransmitScheduler};
use crate::service::{ChannelContext, LinkService, ProtocolKind, ProtocolService, UnprotoService};
use crate::transport::Transport;
use crate::LinkError;

const EVENT_CAPACITY: usize = 1024;

struct ChannelRuntime {
    ctx: Arc<ChannelContext>,
    transport: Arc<dyn Transport>,
    services: Vec<Arc<dyn ProtocolService>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelRuntime {
    fn service(&self, kind: ProtocolKind) -> Option<Arc<dyn ProtocolService>> {
        self.services
            .iter()
            .find(|s| s.supported_protocol() == kind)
            .cloned()
    }
}

/// The link-and-delivery engine: any number of channels, each with its own
/// transport, delivery queue and sessions.
pub struct LinkEngine {
    channels: RwLock<HashMap<ChannelId, ChannelRuntime>>,
    directory: SessionDirectory,
    applications: ApplicationRegistry,
    events: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
}

impl Default for LinkEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channels: RwLock::new(HashMap::new()),
            directory: SessionDirectory::new(),
            applications: ApplicationRegistry::new(),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn applications(&self) -> &ApplicationRegistry {
        &self.applications
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub async fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Connect the transport and start the channel's tasks.
    pub async fn add_channel(
        &self,
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(), LinkError> {
        config.validate()?;
        let mut channels = self.channels.write().await;
        if channels.contains_key(&config.id) {
            return Err(LinkError::ChannelExists(config.id));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(config.link.transport_inbox);
        transport.connect(inbound_tx).await?;
        send_kiss_params(&config, transport.as_ref()).await?;

        self.directory.add_channel(&config.id).await;
        let ctx = Arc::new(ChannelContext {
            config,
            queue: DeliveryQueue::new(),
            directory: self.directory.clone(),
            applications: self.applications.clone(),
            events: self.events.clone(),
            cancel: self.cancel.child_token(),
        });
        let services: Vec<Arc<dyn ProtocolService>> = vec![
            Arc::new(LinkService::new(ctx.clone())),
            Arc::new(UnprotoService::new(ctx.clone())),
        ];

        let scheduler = TransmitScheduler::new(
            ctx.config.id.clone(),
            ctx.config.kiss_port,
            ctx.config.link.clone(),
            ctx.queue.clone(),
            transport.clone(),
            self.events.clone(),
        );
        let tasks = vec![
            tokio::spawn(read_loop(ctx.clone(), inbound_rx, services.clone())),
            tokio::spawn(scheduler.run(ctx.cancel.clone())),
            tokio::spawn(sweep_loop(ctx.clone())),
        ];

        info!(
            "Channel {} up on {} as {:?}",
            ctx.config.id,
            transport.describe(),
            ctx.config.local_callsigns.iter().map(|c| c.to_string()).collect::<Vec<_>>()
        );
        channels.insert(
            ctx.config.id.clone(),
            ChannelRuntime {
                ctx,
                transport,
                services,
                tasks,
            },
        );
        Ok(())
    }

    /// Stop a channel. Its sessions end without sending anything and its
    /// queue is dropped.
    pub async fn remove_channel(&self, id: &ChannelId) -> Result<(), LinkError> {
        let runtime = self
            .channels
            .write()
            .await
            .remove(id)
            .ok_or_else(|| LinkError::UnknownChannel(id.clone()))?;

        runtime.ctx.cancel.cancel();
        for task in runtime.tasks {
            if let Err(e) = task.await {
                warn!("Channel {} task ended abnormally: {}", id, e);
            }
        }
        let sessions = self.directory.remove_channel(id).await;
        for session in &sessions {
            session.wait_closed().await;
        }
        let dropped = runtime.ctx.queue.clear().await;
        if let Err(e) = runtime.transport.disconnect().await {
            warn!("Channel {} transport disconnect failed: {}", id, e);
        }
        info!(
            "Channel {} down, {} sessions closed, {} queued frames dropped",
            id,
            sessions.len(),
            dropped
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        for id in self.channel_ids().await {
            let _ = self.remove_channel(&id).await;
        }
    }

    async fn context(&self, channel: &ChannelId) -> Result<Arc<ChannelContext>, LinkError> {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|rt| rt.ctx.clone())
            .ok_or_else(|| LinkError::UnknownChannel(channel.clone()))
    }

    /// Open a connection from `local` to `remote`. Returns the session at
    /// once; use [`SessionHandle::wait_connected`] for the outcome.
    pub async fn connect(
        &self,
        channel: &ChannelId,
        local: Callsign,
        remote: Callsign,
    ) -> Result<SessionHandle, LinkError> {
        let ctx = self.context(channel).await?;
        if !ctx.config.is_local(&local) {
            return Err(LinkError::NotLocal(local));
        }
        let key = SessionKey::new(channel.clone(), local, remote);
        let spawn_ctx = ctx.clone();
        let (handle, created) = self
            .directory
            .lookup_or_create(&key, |id| spawn_session(spawn_ctx, key.clone(), id))
            .await?;
        if created {
            handle.connect().await?;
        }
        Ok(handle)
    }

    /// Send an unsolicited payload. `RequiresAck` needs a connected session,
    /// `FireAndForget` goes out as UI frames.
    pub async fn push(
        &self,
        channel: &ChannelId,
        local: Callsign,
        remote: Callsign,
        payload: Bytes,
        mode: DeliveryMode,
    ) -> Result<(), LinkError> {
        let service = {
            let channels = self.channels.read().await;
            let runtime = channels
                .get(channel)
                .ok_or_else(|| LinkError::UnknownChannel(channel.clone()))?;
            if !runtime.ctx.config.is_local(&local) {
                return Err(LinkError::NotLocal(local));
            }
            runtime
                .service(ProtocolKind::for_mode(mode))
                .ok_or_else(|| LinkError::InvalidConfig(format!("no service for {:?}", mode)))?
        };
        service.queue_frames_for_delivery(local, remote, payload).await
    }

    pub async fn session(
        &self,
        channel: &ChannelId,
        local: Callsign,
        remote: Callsign,
    ) -> Option<SessionHandle> {
        self.directory
            .get(&SessionKey::new(channel.clone(), local, remote))
            .await
    }

    pub async fn queue_stats(&self, channel: &ChannelId) -> Result<QueueStats, LinkError> {
        Ok(self.context(channel).await?.queue.stats().await)
    }

    pub async fn primary_callsign(&self, channel: &ChannelId) -> Result<Callsign, LinkError> {
        let ctx = self.context(channel).await?;
        ctx.config
            .primary_callsign()
            .ok_or_else(|| LinkError::InvalidConfig(format!("channel {} has no callsign", channel)))
    }
}

async fn send_kiss_params(config: &ChannelConfig, transport: &dyn Transport) -> Result<(), LinkError> {
    let mut codec = KissCodec::new(config.link.frame_size_max);
    for frame in config.kiss_params.frames(config.kiss_port) {
        let mut wire = BytesMut::new();
        codec.encode(frame, &mut wire)?;
        transport.write_bytes(&wire).await?;
    }
    Ok(())
}

async fn read_loop(
    ctx: Arc<ChannelContext>,
    mut inbound: mpsc::Receiver<Bytes>,
    services: Vec<Arc<dyn ProtocolService>>,
) {
    let mut codec = KissCodec::new(ctx.config.link.frame_size_max);
    let mut buffer = BytesMut::new();
    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            chunk = inbound.recv() => match chunk {
                Some(chunk) => chunk,
                None => {
                    warn!("Channel {} transport closed its receive side", ctx.config.id);
                    break;
                }
            },
        };
        buffer.extend_from_slice(&chunk);
        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(kiss)) => dispatch(&ctx, &services, kiss).await,
                Ok(None) => break,
                Err(e) => {
                    debug!("Channel {} framing error: {}", ctx.config.id, e);
                    let _ = ctx.events.send(LinkEvent::FramingError {
                        channel: ctx.config.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    debug!("Channel {} read loop stopped", ctx.config.id);
}

async fn dispatch(ctx: &ChannelContext, services: &[Arc<dyn ProtocolService>], kiss: KissFrame) {
    if kiss.port != ctx.config.kiss_port || kiss.command != KissCommand::Data {
        trace!(
            "Channel {} ignoring KISS {:?} on port {}",
            ctx.config.id,
            kiss.command,
            kiss.port
        );
        return;
    }
    let frame = match Frame::decode(&kiss.data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Channel {} undecodable frame: {}", ctx.config.id, e);
            let _ = ctx.events.send(LinkEvent::FramingError {
                channel: ctx.config.id.clone(),
                error: e.to_string(),
            });
            return;
        }
    };
    trace!("{} RX {}", ctx.config.id, frame);

    let kind = ProtocolKind::of(frame.control);
    if kind == ProtocolKind::Connected && !ctx.config.is_local(&frame.destination) {
        trace!("Channel {} frame for {} is not ours", ctx.config.id, frame.destination);
        return;
    }
    let Some(service) = services.iter().find(|s| s.supported_protocol() == kind) else {
        return;
    };
    if let Err(e) = service.handle_frame(frame).await {
        warn!("Channel {} frame handling failed: {}", ctx.config.id, e);
    }
}

async fn sweep_loop(ctx: Arc<ChannelContext>) {
    let mut ticker = interval(ctx.config.link.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let idle = ctx
            .directory
            .idle_sessions(&ctx.config.id, Instant::now(), ctx.config.link.idle_timeout)
            .await;
        for session in idle {
            debug!("Channel {} sweeping idle session {}", ctx.config.id, session.key());
            session.idle_timeout();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{EtherConfig, SimulatedEther};

    fn config(id: &str) -> ChannelConfig {
        ChannelConfig::new(id, vec!["BBS".parse().unwrap()])
    }

    #[tokio::test]
    async fn test_duplicate_channel_rejected() {
        let ether = SimulatedEther::new(EtherConfig::default());
        let engine = LinkEngine::new();
        engine.add_channel(config("vhf"), ether.transport("a")).await.unwrap();
        let result = engine.add_channel(config("vhf"), ether.transport("b")).await;
        assert!(matches!(result, Err(LinkError::ChannelExists(_))));
        engine.shutdown().await;
        assert!(engine.channel_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_push_checks_channel_and_callsign() {
        let ether = SimulatedEther::new(EtherConfig::default());
        let engine = LinkEngine::new();
        engine.add_channel(config("vhf"), ether.transport("a")).await.unwrap();
        let bbs: Callsign = "BBS".parse().unwrap();
        let peer: Callsign = "N0CALL".parse().unwrap();

        let unknown = engine
            .push(&"hf".into(), bbs, peer, Bytes::from_static(b"x"), DeliveryMode::FireAndForget)
            .await;
        assert!(matches!(unknown, Err(LinkError::UnknownChannel(_))));

        let foreign = engine
            .push(&"vhf".into(), peer, bbs, Bytes::from_static(b"x"), DeliveryMode::FireAndForget)
            .await;
        assert!(matches!(foreign, Err(LinkError::NotLocal(_))));

        let unconnected = engine
            .push(&"vhf".into(), bbs, peer, Bytes::from_static(b"x"), DeliveryMode::RequiresAck)
            .await;
        assert!(matches!(unconnected, Err(LinkError::NotConnected(_))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_kiss_params_sent_on_start() {
        let ether = SimulatedEther::new(EtherConfig::default());
        let transport = ether.transport("a");
        let mut cfg = config("vhf");
        cfg.kiss_params.tx_delay = Some(30);
        cfg.kiss_params.persistence = Some(63);
        let engine = LinkEngine::new();
        engine.add_channel(cfg, transport.clone()).await.unwrap();
        let written = transport.written().await;
        assert_eq!(written.len(), 2);
        assert_eq!(&written[0].1[..], &[0xC0, 0x01, 30, 0xC0]);
        engine.shutdown().await;
    }
}
