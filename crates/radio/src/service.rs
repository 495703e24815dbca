//! Protocol services: frame handling per protocol kind.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use packet_bbs_core::{Callsign, Control, Frame, ProtocolId};

use crate::app::ApplicationRegistry;
use crate::config::ChannelConfig;
use crate::directory::{SessionDirectory, SessionKey};
use crate::event::LinkEvent;
use crate::link::spawn_session;
use crate::scheduler::{DeliveryEntry, DeliveryMode, DeliveryQueue};
use crate::session::SessionState;
use crate::LinkError;

/// Everything a channel's tasks share.
pub struct ChannelContext {
    pub config: ChannelConfig,
    pub queue: DeliveryQueue,
    pub directory: SessionDirectory,
    pub applications: ApplicationRegistry,
    pub events: broadcast::Sender<LinkEvent>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// Sequenced link frames (I, S and U frames other than UI).
    Connected,
    Unproto,
}

impl ProtocolKind {
    pub fn of(control: Control) -> Self {
        match control {
            Control::Unproto => ProtocolKind::Unproto,
            _ => ProtocolKind::Connected,
        }
    }

    pub fn for_mode(mode: DeliveryMode) -> Self {
        match mode {
            DeliveryMode::RequiresAck => ProtocolKind::Connected,
            DeliveryMode::FireAndForget => ProtocolKind::Unproto,
        }
    }
}

#[async_trait]
pub trait ProtocolService: Send + Sync {
    fn supported_protocol(&self) -> ProtocolKind;

    /// Process one frame addressed to this channel.
    async fn handle_frame(&self, frame: Frame) -> Result<(), LinkError>;

    /// Queue an application payload from `local` to `remote`.
    async fn queue_frames_for_delivery(
        &self,
        local: Callsign,
        remote: Callsign,
        payload: Bytes,
    ) -> Result<(), LinkError>;
}

/// Connected mode: routes frames to session actors through the directory.
pub struct LinkService {
    ctx: Arc<ChannelContext>,
}

impl LinkService {
    pub fn new(ctx: Arc<ChannelContext>) -> Self {
        Self { ctx }
    }

    fn key(&self, local: Callsign, remote: Callsign) -> SessionKey {
        SessionKey::new(self.ctx.config.id.clone(), local, remote)
    }

    /// Answer a frame from a peer we hold no session for.
    async fn refuse(&self, frame: &Frame) {
        let answer = match frame.control {
            Control::Disconnect => true,
            Control::DisconnectedMode | Control::UnnumberedAck => false,
            _ => frame.command && frame.poll_final,
        };
        if !answer {
            trace!("{} ignoring {} from unknown peer", self.ctx.config.id, frame);
            return;
        }
        debug!("{} not connected to {}, answering DM", self.ctx.config.id, frame.source);
        let dm = Frame::new(
            frame.source,
            frame.destination,
            Control::DisconnectedMode,
            false,
            frame.poll_final,
        );
        self.ctx
            .queue
            .enqueue(DeliveryEntry::unowned(dm, DeliveryMode::FireAndForget))
            .await;
    }
}

#[async_trait]
impl ProtocolService for LinkService {
    fn supported_protocol(&self) -> ProtocolKind {
        ProtocolKind::Connected
    }

    async fn handle_frame(&self, frame: Frame) -> Result<(), LinkError> {
        let key = self.key(frame.destination, frame.source);

        let frame = match self.ctx.directory.get(&key).await {
            Some(handle) if !handle.is_closed() => match handle.offer_frame(frame) {
                Ok(()) => return Ok(()),
                Err(frame) => frame,
            },
            _ => frame,
        };

        if frame.control != Control::Connect {
            self.refuse(&frame).await;
            return Ok(());
        }

        let ctx = self.ctx.clone();
        let (handle, created) = self
            .ctx
            .directory
            .lookup_or_create(&key, |id| spawn_session(ctx, key.clone(), id))
            .await?;
        if created {
            debug!("{} new session from {}", self.ctx.config.id, key.remote);
        }
        // A session that died in between simply never answers; the peer retries.
        let _ = handle.offer_frame(frame);
        Ok(())
    }

    async fn queue_frames_for_delivery(
        &self,
        local: Callsign,
        remote: Callsign,
        payload: Bytes,
    ) -> Result<(), LinkError> {
        let key = self.key(local, remote);
        match self.ctx.directory.get(&key).await {
            Some(handle) if handle.state() == SessionState::Connected => handle.send(payload).await,
            _ => Err(LinkError::NotConnected(key)),
        }
    }
}

/// Unnumbered information: no state, no retries.
pub struct UnprotoService {
    ctx: Arc<ChannelContext>,
}

impl UnprotoService {
    pub fn new(ctx: Arc<ChannelContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolService for UnprotoService {
    fn supported_protocol(&self) -> ProtocolKind {
        ProtocolKind::Unproto
    }

    async fn handle_frame(&self, frame: Frame) -> Result<(), LinkError> {
        trace!("{} UI {}", self.ctx.config.id, frame);
        let _ = self.ctx.events.send(LinkEvent::UnprotoReceived {
            channel: self.ctx.config.id.clone(),
            source: frame.source,
            destination: frame.destination,
            payload: frame.payload,
        });
        Ok(())
    }

    async fn queue_frames_for_delivery(
        &self,
        local: Callsign,
        remote: Callsign,
        payload: Bytes,
    ) -> Result<(), LinkError> {
        let chunk = self.ctx.config.link.info_len();
        let mut rest = payload;
        loop {
            let part = rest.split_to(chunk.min(rest.len()));
            let frame = Frame::unproto(remote, local, ProtocolId::Text, part);
            self.ctx
                .queue
                .enqueue(DeliveryEntry::unowned(frame, DeliveryMode::FireAndForget))
                .await;
            if rest.is_empty() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<ChannelContext> {
        let (events, _) = broadcast::channel(16);
        let mut config = ChannelConfig::new("vhf", vec!["BBS".parse().unwrap()]);
        config.link.frame_size_max = 20;
        Arc::new(ChannelContext {
            config,
            queue: DeliveryQueue::new(),
            directory: SessionDirectory::new(),
            applications: ApplicationRegistry::new(),
            events,
            cancel: CancellationToken::new(),
        })
    }

    #[test]
    fn test_protocol_kind_dispatch() {
        assert_eq!(ProtocolKind::of(Control::Unproto), ProtocolKind::Unproto);
        assert_eq!(ProtocolKind::of(Control::Connect), ProtocolKind::Connected);
        assert_eq!(
            ProtocolKind::of(Control::Information { ns: 1, nr: 2 }),
            ProtocolKind::Connected
        );
        assert_eq!(ProtocolKind::for_mode(DeliveryMode::FireAndForget), ProtocolKind::Unproto);
    }

    #[tokio::test]
    async fn test_unproto_payload_is_split() {
        let ctx = context();
        let service = UnprotoService::new(ctx.clone());
        service
            .queue_frames_for_delivery(
                "BBS".parse().unwrap(),
                "BEACON".parse().unwrap(),
                Bytes::from_static(b"0123456789"),
            )
            .await
            .unwrap();
        let queued = ctx.queue.snapshot().await;
        assert_eq!(queued.len(), 3);
        assert_eq!(queued[2].frame.payload, Bytes::from_static(b"89"));
        assert!(queued.iter().all(|e| e.frame.control == Control::Unproto));
    }

    #[tokio::test]
    async fn test_unknown_peer_gets_dm() {
        let ctx = context();
        ctx.directory.add_channel(&ctx.config.id).await;
        let service = LinkService::new(ctx.clone());
        let peer = "N0CALL".parse().unwrap();
        let bbs = "BBS".parse().unwrap();

        let poll = Frame::new(bbs, peer, Control::ReceiveReady { nr: 0 }, true, true);
        service.handle_frame(poll).await.unwrap();
        let quiet = Frame::new(bbs, peer, Control::ReceiveReady { nr: 0 }, false, false);
        service.handle_frame(quiet).await.unwrap();

        let queued = ctx.queue.snapshot().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].frame.control, Control::DisconnectedMode);
        assert_eq!(queued[0].frame.destination, peer);
        assert_eq!(ctx.directory.len(&ctx.config.id).await, 0);
    }

    #[tokio::test]
    async fn test_push_requires_connected_session() {
        let ctx = context();
        ctx.directory.add_channel(&ctx.config.id).await;
        let service = LinkService::new(ctx);
        let result = service
            .queue_frames_for_delivery(
                "BBS".parse().unwrap(),
                "N0CALL".parse().unwrap(),
                Bytes::from_static(b"hi"),
            )
            .await;
        assert!(matches!(result, Err(LinkError::NotConnected(_))));
    }
}
