//! TOML configuration of the node daemon.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use packet_bbs_core::Callsign;
use packet_bbs_radio::{ChannelConfig, KissParams, LinkConfig, Transport};
use packet_bbs_tnc::{SerialConfig, SerialKissTransport, TcpConfig, TcpKissTransport};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    pub beacon: Option<BeaconConfig>,
    #[serde(rename = "channel")]
    pub channels: Vec<ChannelSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    pub banner: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            banner: "Welcome to packet-bbs. Type help for commands.".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeaconConfig {
    pub interval_secs: u64,
    pub destination: Option<Callsign>,
    pub text: String,
}

pub const DEFAULT_BEACON_DESTINATION: &str = "BEACON";

impl BeaconConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn destination(&self) -> Result<Callsign> {
        match self.destination {
            Some(destination) => Ok(destination),
            None => Ok(DEFAULT_BEACON_DESTINATION.parse()?),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSection {
    pub id: String,
    #[serde(default)]
    pub kiss_port: u8,
    pub callsigns: Vec<Callsign>,
    pub transport: TransportSection,
    #[serde(default)]
    pub link: LinkSection,
    #[serde(default)]
    pub kiss: KissParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSection {
    Tcp {
        host: String,
        #[serde(default = "default_kiss_tcp_port")]
        port: u16,
        connect_timeout_secs: Option<u64>,
    },
    Serial {
        path: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
}

fn default_kiss_tcp_port() -> u16 {
    8001
}

fn default_baud() -> u32 {
    9600
}

/// Per-channel overrides of [`LinkConfig`]; durations in seconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSection {
    pub frame_size_max: Option<usize>,
    pub frames_per_turn: Option<usize>,
    pub min_tx_pause_secs: Option<f64>,
    pub max_delivery_attempts: Option<u32>,
    pub delivery_retry_secs: Option<f64>,
    pub window_size: Option<u8>,
    pub idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub session_inbox: Option<usize>,
    pub transport_inbox: Option<usize>,
    pub health_failure_threshold: Option<u32>,
}

impl LinkSection {
    pub fn apply(&self, mut link: LinkConfig) -> Result<LinkConfig> {
        if let Some(v) = self.frame_size_max {
            link.frame_size_max = v;
        }
        if let Some(v) = self.frames_per_turn {
            link.frames_per_turn = v;
        }
        if let Some(v) = self.min_tx_pause_secs {
            link.min_tx_pause = seconds("min_tx_pause_secs", v)?;
        }
        if let Some(v) = self.max_delivery_attempts {
            link.max_delivery_attempts = v;
        }
        if let Some(v) = self.delivery_retry_secs {
            link.delivery_retry_time = seconds("delivery_retry_secs", v)?;
        }
        if let Some(v) = self.window_size {
            link.window_size = v;
        }
        if let Some(v) = self.idle_timeout_secs {
            link.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = self.sweep_interval_secs {
            link.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = self.session_inbox {
            link.session_inbox = v;
        }
        if let Some(v) = self.transport_inbox {
            link.transport_inbox = v;
        }
        if let Some(v) = self.health_failure_threshold {
            link.health_failure_threshold = v;
        }
        Ok(link)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{} = {} is not a duration", field, value))
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text)?;
        if config.channels.is_empty() {
            bail!("at least one [[channel]] is required");
        }
        if let Some(beacon) = &config.beacon {
            if beacon.interval_secs == 0 {
                bail!("beacon interval_secs must be positive");
            }
        }
        Ok(config)
    }
}

impl ChannelSection {
    /// Engine side settings, validated.
    pub fn channel_config(&self) -> Result<ChannelConfig> {
        let mut config = ChannelConfig::new(self.id.clone(), self.callsigns.clone());
        config.kiss_port = self.kiss_port;
        config.kiss_params = self.kiss.clone();
        config.link = self.link.apply(LinkConfig::default())?;
        config
            .validate()
            .with_context(|| format!("channel {}", self.id))?;
        Ok(config)
    }

    pub fn build_transport(&self) -> Arc<dyn Transport> {
        match &self.transport {
            TransportSection::Tcp {
                host,
                port,
                connect_timeout_secs,
            } => {
                let mut tcp = TcpConfig::new(host.clone());
                tcp.port = *port;
                if let Some(secs) = connect_timeout_secs {
                    tcp.connect_timeout = Some(Duration::from_secs(*secs));
                }
                Arc::new(TcpKissTransport::new(tcp))
            }
            TransportSection::Serial { path, baud } => {
                Arc::new(SerialKissTransport::new(SerialConfig::new(path.clone(), *baud)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[shell]
banner = "N0CALL BBS"

[beacon]
interval_secs = 600
text = "N0CALL BBS on 145.050"

[[channel]]
id = "vhf"
callsigns = ["n0call", "N0CALL-1"]

[channel.transport]
kind = "tcp"
host = "127.0.0.1"

[channel.link]
window_size = 2
min_tx_pause_secs = 1.5
idle_timeout_secs = 300

[channel.kiss]
tx_delay = 30

[[channel]]
id = "hf"
kiss_port = 1
callsigns = ["N0CALL-7"]

[channel.transport]
kind = "serial"
path = "/dev/ttyUSB0"
baud = 1200
"#;

    #[test]
    fn test_parses_a_full_config() {
        let config = NodeConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.shell.banner, "N0CALL BBS");
        let beacon = config.beacon.as_ref().unwrap();
        assert_eq!(beacon.interval(), Duration::from_secs(600));
        assert_eq!(beacon.destination().unwrap().to_string(), "BEACON");
        assert_eq!(config.channels.len(), 2);

        let vhf = config.channels[0].channel_config().unwrap();
        assert_eq!(vhf.local_callsigns[0].to_string(), "N0CALL");
        assert_eq!(vhf.link.window_size, 2);
        assert_eq!(vhf.link.min_tx_pause, Duration::from_millis(1500));
        assert_eq!(vhf.link.idle_timeout, Duration::from_secs(300));
        assert_eq!(vhf.link.frames_per_turn, LinkConfig::default().frames_per_turn);
        assert_eq!(vhf.kiss_params.tx_delay, Some(30));
        assert!(matches!(
            config.channels[0].transport,
            TransportSection::Tcp { port: 8001, .. }
        ));

        let hf = config.channels[1].channel_config().unwrap();
        assert_eq!(hf.kiss_port, 1);
        assert!(matches!(
            config.channels[1].transport,
            TransportSection::Serial { baud: 1200, .. }
        ));
        assert_eq!(config.channels[1].build_transport().describe(), "serial:/dev/ttyUSB0@1200");
    }

    #[test]
    fn test_rejects_a_config_without_channels() {
        assert!(NodeConfig::parse("channel = []").is_err());
    }

    #[test]
    fn test_rejects_an_invalid_window() {
        let text = r#"
[[channel]]
id = "vhf"
callsigns = ["N0CALL"]
transport = { kind = "tcp", host = "localhost" }
link = { window_size = 9 }
"#;
        let config = NodeConfig::parse(text).unwrap();
        assert!(config.channels[0].channel_config().is_err());
    }

    #[test]
    fn test_rejects_bad_callsigns() {
        let text = r#"
[[channel]]
id = "vhf"
callsigns = ["TOOLONGCALL"]
transport = { kind = "tcp", host = "localhost" }
"#;
        assert!(NodeConfig::parse(text).is_err());
    }
}
