use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use packet_bbs_radio::{Transport, TransportError};

use crate::StreamLink;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl TcpConfig {
    /// 8001 is the usual KISS port of software TNCs.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 8001,
            connect_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// KISS over a TCP connection.
pub struct TcpKissTransport {
    config: TcpConfig,
    link: StreamLink,
}

impl TcpKissTransport {
    pub fn new(config: TcpConfig) -> Self {
        let name = format!("tcp:{}:{}", config.host, config.port);
        let link = StreamLink::new(name, config.write_timeout);
        Self { config, link }
    }
}

#[async_trait]
impl Transport for TcpKissTransport {
    async fn connect(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError> {
        let connecting = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let stream = match self.config.connect_timeout {
            Some(limit) => timeout(limit, connecting).await.map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.describe()),
                ))
            })??,
            None => connecting.await?,
        };
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        self.link.attach(reader, Box::new(writer), inbound).await;
        info!("Connected to KISS TNC at {}", peer);
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
        format!("tcp:{}:{}", self.config.host, self.config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpKissTransport, TcpStream, mpsc::Receiver<Bytes>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = TcpConfig::new("127.0.0.1");
        config.port = listener.local_addr().unwrap().port();
        let transport = TcpKissTransport::new(config);
        let (tx, rx) = mpsc::channel(16);
        let (connected, accepted) = tokio::join!(transport.connect(tx), listener.accept());
        connected.unwrap();
        (transport, accepted.unwrap().0, rx)
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (transport, mut tnc, mut rx) = pair().await;
        assert!(transport.is_connected());

        transport.write_bytes(&[0xC0, 0x00, 0x41, 0xC0]).await.unwrap();
        let mut buf = [0u8; 4];
        tnc.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xC0, 0x00, 0x41, 0xC0]);

        tnc.write_all(b"\xC0\x00hi\xC0").await.unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            got.extend_from_slice(&rx.recv().await.unwrap());
        }
        assert_eq!(got, b"\xC0\x00hi\xC0");
    }

    #[tokio::test]
    async fn test_remote_close_marks_disconnected() {
        let (transport, tnc, _rx) = pair().await;
        drop(tnc);
        for _ in 0..100 {
            if !transport.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_write_before_connect_fails() {
        let transport = TcpKissTransport::new(TcpConfig::new("127.0.0.1"));
        assert!(matches!(
            transport.write_bytes(b"x").await,
            Err(TransportError::NotConnected)
        ));
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }
}
