//! Events published by the link engine.

use std::fmt;

use bytes::Bytes;
use packet_bbs_core::Callsign;

use crate::config::ChannelId;
use crate::directory::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Disconnect requested on this side and acknowledged (or given up on).
    Local,
    Remote,
    Refused,
    HandshakeTimeout,
    DeliveryTimeout,
    IdleTimeout,
    ChannelShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Local => "local disconnect",
            DisconnectReason::Remote => "remote disconnect",
            DisconnectReason::Refused => "refused",
            DisconnectReason::HandshakeTimeout => "connect timeout",
            DisconnectReason::DeliveryTimeout => "delivery timeout",
            DisconnectReason::IdleTimeout => "idle timeout",
            DisconnectReason::ChannelShutdown => "channel shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected(SessionKey),
    Disconnected {
        key: SessionKey,
        reason: DisconnectReason,
    },
    /// A locally originated connect was refused or never answered.
    ConnectionFailed {
        key: SessionKey,
        reason: DisconnectReason,
    },
    DeliveryFailed {
        key: SessionKey,
        seq: u8,
    },
    /// Consecutive transport write failures reached the configured threshold.
    ChannelHealth {
        channel: ChannelId,
        consecutive_failures: u32,
    },
    FramingError {
        channel: ChannelId,
        error: String,
    },
    UnprotoReceived {
        channel: ChannelId,
        source: Callsign,
        destination: Callsign,
        payload: Bytes,
    },
}
