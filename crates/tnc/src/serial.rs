use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;

use packet_bbs_radio::{Transport, TransportError};

use crate::StreamLink;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialConfig {
    pub path: String,
    pub baud: u32,
    pub write_timeout: Option<Duration>,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// KISS over a serial port, 8N1.
pub struct SerialKissTransport {
    config: SerialConfig,
    link: StreamLink,
}

impl SerialKissTransport {
    pub fn new(config: SerialConfig) -> Self {
        let name = format!("serial:{}", config.path);
        let link = StreamLink::new(name, config.write_timeout);
        Self { config, link }
    }
}

#[async_trait]
impl Transport for SerialKissTransport {
    async fn connect(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError> {
        let port = tokio_serial::new(&self.config.path, self.config.baud)
            .open_native_async()
            .map_err(std::io::Error::from)?;
        let (reader, writer) = tokio::io::split(port);
        self.link.attach(reader, Box::new(writer), inbound).await;
        info!("Opened {} at {} baud", self.config.path, self.config.baud);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.link.detach().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        self.link.write(data).await
    }

    fn describe(&self) -> String {
        format!("serial:{}@{}", self.config.path, self.config.baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device_is_an_error() {
        let transport = SerialKissTransport::new(SerialConfig::new("/dev/no-such-tnc", 9600));
        let (tx, _rx) = mpsc::channel(1);
        assert!(transport.connect(tx).await.is_err());
        assert!(!transport.is_connected());
        assert_eq!(transport.describe(), "serial:/dev/no-such-tnc@9600");
    }
}
