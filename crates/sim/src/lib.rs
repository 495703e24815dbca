//! simulation tools for packet-bbs links

pub mod scenarios;

use std::time::Duration;

use packet_bbs_radio::{EtherConfig, LinkConfig};

/// Channel conditions plus the link tuning a sysop would pick for them.
#[derive(Debug, Clone)]
pub struct Conditions {
    pub ether: EtherConfig,
    pub link: LinkConfig,
}

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> Conditions {
        Conditions {
            ether: EtherConfig {
                packet_loss: 0.05,
                latency: Duration::from_millis(100),
            },
            link: LinkConfig {
                min_tx_pause: Duration::from_millis(500),
                delivery_retry_time: Duration::from_secs(5),
                ..Default::default()
            },
        }
    }

    pub fn average_conditions() -> Conditions {
        Conditions {
            ether: EtherConfig {
                packet_loss: 0.15,
                latency: Duration::from_millis(200),
            },
            link: LinkConfig {
                min_tx_pause: Duration::from_secs(1),
                delivery_retry_time: Duration::from_secs(8),
                max_delivery_attempts: 10,
                ..Default::default()
            },
        }
    }

    pub fn poor_conditions() -> Conditions {
        Conditions {
            ether: EtherConfig {
                packet_loss: 0.30,
                latency: Duration::from_millis(500),
            },
            link: LinkConfig {
                frame_size_max: 128,
                window_size: 2,
                delivery_retry_time: Duration::from_secs(10),
                max_delivery_attempts: 20,
                ..Default::default()
            },
        }
    }

    /// Half the frames lost; only a small window and many retries get through.
    pub fn extreme_conditions() -> Conditions {
        Conditions {
            ether: EtherConfig {
                packet_loss: 0.50,
                latency: Duration::from_millis(1000),
            },
            link: LinkConfig {
                frame_size_max: 96,
                window_size: 1,
                frames_per_turn: 2,
                delivery_retry_time: Duration::from_secs(15),
                max_delivery_attempts: 40,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid_link_configs() {
        for conditions in [
            SimulationPresets::good_conditions(),
            SimulationPresets::average_conditions(),
            SimulationPresets::poor_conditions(),
            SimulationPresets::extreme_conditions(),
        ] {
            assert!(conditions.link.validate().is_ok());
            assert!((0.0..1.0).contains(&conditions.ether.packet_loss));
        }
    }
}
