//! Registry of live sessions, keyed by channel and station pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};

use packet_bbs_core::Callsign;

use crate::config::ChannelId;
use crate::link::SessionHandle;
use crate::LinkError;

/// Identity of a session: at most one live session per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub channel: ChannelId,
    pub local: Callsign,
    pub remote: Callsign,
}

impl SessionKey {
    pub fn new(channel: ChannelId, local: Callsign, remote: Callsign) -> Self {
        Self {
            channel,
            local,
            remote,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}<->{}", self.channel, self.local, self.remote)
    }
}

type Shard = Arc<Mutex<HashMap<(Callsign, Callsign), SessionHandle>>>;

/// Sessions grouped per channel. Each channel has its own lock, so traffic on
/// one channel never waits for another.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    shards: Arc<RwLock<HashMap<ChannelId, Shard>>>,
    next_id: Arc<AtomicU64>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the channel was already present.
    pub async fn add_channel(&self, channel: &ChannelId) -> bool {
        let mut shards = self.shards.write().await;
        if shards.contains_key(channel) {
            return false;
        }
        shards.insert(channel.clone(), Arc::default());
        true
    }

    /// Remove a channel and hand back the sessions it still had.
    pub async fn remove_channel(&self, channel: &ChannelId) -> Vec<SessionHandle> {
        let shard = self.shards.write().await.remove(channel);
        match shard {
            Some(shard) => shard.lock().await.drain().map(|(_, h)| h).collect(),
            None => Vec::new(),
        }
    }

    async fn shard(&self, channel: &ChannelId) -> Option<Shard> {
        self.shards.read().await.get(channel).cloned()
    }

    pub async fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        let shard = self.shard(&key.channel).await?;
        let sessions = shard.lock().await;
        sessions.get(&(key.local, key.remote)).cloned()
    }

    /// Return the live session for `key`, creating it with `create` if there
    /// is none. The boolean is true when a new session was created.
    ///
    /// Check and insert happen under the channel lock, so concurrent callers
    /// for the same key always end up with the same session.
    pub async fn lookup_or_create<F>(
        &self,
        key: &SessionKey,
        create: F,
    ) -> Result<(SessionHandle, bool), LinkError>
    where
        F: FnOnce(u64) -> SessionHandle,
    {
        let shard = self
            .shard(&key.channel)
            .await
            .ok_or_else(|| LinkError::UnknownChannel(key.channel.clone()))?;
        let mut sessions = shard.lock().await;
        if let Some(handle) = sessions.get(&(key.local, key.remote)) {
            if !handle.is_closed() {
                return Ok((handle.clone(), false));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = create(id);
        debug!("Session {} created as #{}", key, id);
        sessions.insert((key.local, key.remote), handle.clone());
        Ok((handle, true))
    }

    /// Remove the entry for `key` if it still belongs to session `id`.
    pub async fn remove(&self, key: &SessionKey, id: u64) -> bool {
        let Some(shard) = self.shard(&key.channel).await else {
            return false;
        };
        let mut sessions = shard.lock().await;
        match sessions.get(&(key.local, key.remote)) {
            Some(handle) if handle.id() == id => {
                sessions.remove(&(key.local, key.remote));
                true
            }
            _ => false,
        }
    }

    pub async fn sessions(&self, channel: &ChannelId) -> Vec<SessionHandle> {
        match self.shard(channel).await {
            Some(shard) => shard.lock().await.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Sessions on `channel` without activity for at least `idle`.
    pub async fn idle_sessions(
        &self,
        channel: &ChannelId,
        now: Instant,
        idle: Duration,
    ) -> Vec<SessionHandle> {
        self.sessions(channel)
            .await
            .into_iter()
            .filter(|h| now.saturating_duration_since(h.last_activity()) >= idle)
            .collect()
    }

    pub async fn len(&self, channel: &ChannelId) -> usize {
        match self.shard(channel).await {
            Some(shard) => shard.lock().await.len(),
            None => 0,
        }
    }
}
