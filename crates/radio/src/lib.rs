//! link and delivery engine for packet-bbs

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use packet_bbs_core::{Callsign, FrameError};

pub mod app;
pub mod config;
pub mod directory;
pub mod engine;
pub mod event;
pub mod kiss;
pub mod link;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod simulated;
pub mod transport;

pub use app::{Application, ApplicationRegistry, ConnectDecision, Response, SessionContext};
pub use config::{ChannelConfig, ChannelId, KissParams};
pub use directory::{SessionDirectory, SessionKey};
pub use engine::LinkEngine;
pub use event::{DisconnectReason, LinkEvent};
pub use kiss::{KissCodec, KissCommand, KissError, KissFrame};
pub use link::{SessionHandle, SessionStatus};
pub use scheduler::{DeliveryEntry, DeliveryMode, DeliveryQueue, QueueStats, TransmitScheduler};
pub use service::{ChannelContext, LinkService, ProtocolKind, ProtocolService, UnprotoService};
pub use session::{Action, LinkSession, SessionParams, SessionState};
pub use simulated::{EtherConfig, EtherStats, SimulatedEther, SimulatedTransport};
pub use transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("channel {0} already running")]
    ChannelExists(ChannelId),

    #[error("{0} is not a local callsign on this channel")]
    NotLocal(Callsign),

    #[error("no connected session for {0}")]
    NotConnected(SessionKey),

    #[error("session closed")]
    SessionClosed,

    #[error("connection refused by peer")]
    Refused,

    #[error("connect handshake timed out")]
    HandshakeTimeout,

    #[error("delivery retries exhausted")]
    DeliveryTimeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("kiss error: {0}")]
    Kiss(#[from] KissError),
}

/// Link layer and pacing parameters of one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Largest AX.25 frame (unescaped, without KISS command byte).
    pub frame_size_max: usize,
    pub frames_per_turn: usize,
    pub min_tx_pause: Duration,
    /// Retransmissions allowed after the initial send.
    pub max_delivery_attempts: u32,
    pub delivery_retry_time: Duration,
    /// Outstanding I frame window, 1..=7.
    pub window_size: u8,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub session_inbox: usize,
    pub transport_inbox: usize,
    /// Consecutive write failures before a channel health event.
    pub health_failure_threshold: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            frame_size_max: 256,
            frames_per_turn: 4,
            min_tx_pause: Duration::from_secs(2),
            max_delivery_attempts: 5,
            delivery_retry_time: Duration::from_secs(10),
            window_size: 4,
            idle_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(30),
            session_inbox: 64,
            transport_inbox: 256,
            health_failure_threshold: 3,
        }
    }
}

/// Address, control and PID bytes of a frame without digipeaters.
pub const FRAME_HEADER_LEN: usize = 16;

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if !(1..=7).contains(&self.window_size) {
            return Err(LinkError::InvalidConfig(format!(
                "window_size {} outside 1..=7",
                self.window_size
            )));
        }
        if self.frames_per_turn == 0 {
            return Err(LinkError::InvalidConfig("frames_per_turn must be at least 1".into()));
        }
        if self.frame_size_max <= FRAME_HEADER_LEN {
            return Err(LinkError::InvalidConfig(format!(
                "frame_size_max {} leaves no room for information",
                self.frame_size_max
            )));
        }
        if self.session_inbox == 0 || self.transport_inbox == 0 {
            return Err(LinkError::InvalidConfig("queue depths must be non-zero".into()));
        }
        Ok(())
    }

    /// Largest information field that fits one frame.
    pub fn info_len(&self) -> usize {
        self.frame_size_max.saturating_sub(FRAME_HEADER_LEN).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.info_len(), 240);
    }

    #[test]
    fn test_rejects_oversized_window() {
        let config = LinkConfig {
            window_size: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LinkError::InvalidConfig(_))));
    }
}
