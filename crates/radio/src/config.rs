use std::fmt;

use serde::{Deserialize, Serialize};

use packet_bbs_core::Callsign;

use crate::kiss::{KissCommand, KissFrame};
use crate::{LinkConfig, LinkError};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// TNC parameters sent as KISS command frames when a channel starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KissParams {
    /// In 10 ms units.
    pub tx_delay: Option<u8>,
    pub persistence: Option<u8>,
    /// In 10 ms units.
    pub slot_time: Option<u8>,
    pub tx_tail: Option<u8>,
    pub full_duplex: Option<bool>,
}

impl KissParams {
    pub fn frames(&self, port: u8) -> Vec<KissFrame> {
        let mut frames = Vec::new();
        let mut push = |command, value: Option<u8>| {
            if let Some(v) = value {
                frames.push(KissFrame::command(port, command, v));
            }
        };
        push(KissCommand::TxDelay, self.tx_delay);
        push(KissCommand::Persistence, self.persistence);
        push(KissCommand::SlotTime, self.slot_time);
        push(KissCommand::TxTail, self.tx_tail);
        push(KissCommand::FullDuplex, self.full_duplex.map(u8::from));
        frames
    }
}

/// Engine side configuration of one physical channel.
///
/// Transport parameters live with the transport implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub kiss_port: u8,
    pub local_callsigns: Vec<Callsign>,
    pub link: LinkConfig,
    pub kiss_params: KissParams,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, local_callsigns: Vec<Callsign>) -> Self {
        Self {
            id: ChannelId::new(id),
            kiss_port: 0,
            local_callsigns,
            link: LinkConfig::default(),
            kiss_params: KissParams::default(),
        }
    }

    pub fn is_local(&self, callsign: &Callsign) -> bool {
        self.local_callsigns.contains(callsign)
    }

    pub fn primary_callsign(&self) -> Option<Callsign> {
        self.local_callsigns.first().copied()
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.kiss_port > 15 {
            return Err(LinkError::InvalidConfig(format!(
                "kiss_port {} outside 0..=15",
                self.kiss_port
            )));
        }
        if self.local_callsigns.is_empty() {
            return Err(LinkError::InvalidConfig(format!(
                "channel {} has no local callsign",
                self.id
            )));
        }
        self.link.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kiss_params_become_command_frames() {
        let params = KissParams {
            tx_delay: Some(30),
            full_duplex: Some(false),
            ..Default::default()
        };
        let frames = params.frames(2);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].port, 2);
        assert_eq!(frames[0].command, KissCommand::TxDelay);
        assert_eq!(&frames[0].data[..], &[30]);
        assert_eq!(frames[1].command, KissCommand::FullDuplex);
        assert_eq!(&frames[1].data[..], &[0]);
    }

    #[test]
    fn test_channel_needs_a_callsign() {
        let config = ChannelConfig::new("vhf", Vec::new());
        assert!(config.validate().is_err());

        let config = ChannelConfig::new("vhf", vec!["BBS".parse().unwrap()]);
        assert!(config.validate().is_ok());
        assert!(config.is_local(&"BBS".parse().unwrap()));
    }
}
