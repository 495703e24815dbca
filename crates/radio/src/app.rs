//! Applications served over connected sessions and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use packet_bbs_core::{Callsign, ProtocolId};

use crate::config::ChannelId;
use crate::directory::SessionKey;
use crate::event::DisconnectReason;

/// What an application sees about the session it is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub key: SessionKey,
    pub pid: ProtocolId,
    /// True when this station opened the link.
    pub originated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Reply(Bytes),
    /// Send the reply, then disconnect once it is acknowledged.
    ReplyAndDisconnect(Bytes),
    Disconnect,
    Nothing,
}

#[async_trait]
pub trait Application: Send + Sync {
    fn name(&self) -> &str;

    async fn decision_on_connection_request(&self, _ctx: &SessionContext) -> ConnectDecision {
        ConnectDecision::Accept
    }

    /// Called when the link comes up, e.g. to send a greeting.
    async fn on_connected(&self, _ctx: &SessionContext) -> Response {
        Response::Nothing
    }

    /// Called once per in-order payload.
    async fn handle_received_message(&self, ctx: &SessionContext, payload: Bytes) -> Response;

    async fn on_disconnect(&self, _ctx: &SessionContext, _reason: DisconnectReason) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    Station(ChannelId, Callsign),
    Channel(ChannelId),
    Default,
}

/// Maps (channel, local callsign) to the application serving it.
///
/// Lookup falls back from the exact station to the channel to the default.
#[derive(Clone, Default)]
pub struct ApplicationRegistry {
    apps: Arc<RwLock<HashMap<Scope, Arc<dyn Application>>>>,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_station(
        &self,
        channel: ChannelId,
        local: Callsign,
        app: Arc<dyn Application>,
    ) {
        self.apps.write().await.insert(Scope::Station(channel, local), app);
    }

    pub async fn register_channel(&self, channel: ChannelId, app: Arc<dyn Application>) {
        self.apps.write().await.insert(Scope::Channel(channel), app);
    }

    pub async fn register_default(&self, app: Arc<dyn Application>) {
        self.apps.write().await.insert(Scope::Default, app);
    }

    pub async fn unregister_station(&self, channel: ChannelId, local: Callsign) -> bool {
        self.apps
            .write()
            .await
            .remove(&Scope::Station(channel, local))
            .is_some()
    }

    pub async fn resolve(&self, channel: &ChannelId, local: Callsign) -> Option<Arc<dyn Application>> {
        let apps = self.apps.read().await;
        apps.get(&Scope::Station(channel.clone(), local))
            .or_else(|| apps.get(&Scope::Channel(channel.clone())))
            .or_else(|| apps.get(&Scope::Default))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Application for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle_received_message(&self, _ctx: &SessionContext, _payload: Bytes) -> Response {
            Response::Nothing
        }
    }

    #[tokio::test]
    async fn test_resolution_falls_back() {
        let registry = ApplicationRegistry::new();
        let vhf = ChannelId::new("vhf");
        let bbs: Callsign = "BBS".parse().unwrap();
        let node: Callsign = "BBS-2".parse().unwrap();

        assert!(registry.resolve(&vhf, bbs).await.is_none());

        registry.register_default(Arc::new(Named("default"))).await;
        registry.register_channel(vhf.clone(), Arc::new(Named("channel"))).await;
        registry
            .register_station(vhf.clone(), bbs, Arc::new(Named("station")))
            .await;

        assert_eq!(registry.resolve(&vhf, bbs).await.unwrap().name(), "station");
        assert_eq!(registry.resolve(&vhf, node).await.unwrap().name(), "channel");
        assert_eq!(
            registry.resolve(&"hf".into(), bbs).await.unwrap().name(),
            "default"
        );

        assert!(registry.unregister_station(vhf.clone(), bbs).await);
        assert_eq!(registry.resolve(&vhf, bbs).await.unwrap().name(), "channel");
    }
}
