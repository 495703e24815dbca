//! Boundary to the byte-level transports (serial port, TCP socket).

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("transport write failed: {0}")]
    WriteFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A physical channel that moves raw bytes. Framing happens above it.
///
/// Received bytes are pushed into the bounded `inbound` channel handed to
/// [`Transport::connect`]; a full channel slows the reader down instead of
/// buffering without limit.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    async fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Short human readable description for logs.
    fn describe(&self) -> String;
}
