//! Byte transports to KISS TNCs: TCP (software modems such as Dire Wolf)
//! and serial ports (hardware TNCs).

mod serial;
mod tcp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use packet_bbs_radio::TransportError;

pub use serial::{SerialConfig, SerialKissTransport};
pub use tcp::{TcpConfig, TcpKissTransport};

const READ_CHUNK: usize = 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader task plus locked writer shared by the stream transports.
struct StreamLink {
    name: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    write_timeout: Option<Duration>,
}

impl StreamLink {
    fn new(name: String, write_timeout: Option<Duration>) -> Self {
        Self {
            name,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            write_timeout,
        }
    }

    async fn attach<R>(&self, reader: R, writer: BoxedWriter, inbound: mpsc::Sender<Bytes>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.detach().await;
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(pump(self.name.clone(), reader, inbound, self.connected.clone()));
        *self.reader.lock().await = Some(task);
    }

    async fn detach(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let result = match self.write_timeout {
            Some(limit) => match timeout(limit, write_flush(writer, data)).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(TransportError::WriteFailure(format!(
                        "{} write timed out after {:?}",
                        self.name, limit
                    )))
                }
            },
            None => write_flush(writer, data).await,
        };
        if let Err(e) = result {
            warn!("{} write error: {}", self.name, e);
            return Err(TransportError::WriteFailure(e.to_string()));
        }
        Ok(())
    }
}

async fn write_flush(writer: &mut BoxedWriter, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Copy bytes from the device into the engine's inbound channel until EOF.
async fn pump<R>(name: String, mut reader: R, inbound: mpsc::Sender<Bytes>, connected: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("{} closed by remote end", name);
                break;
            }
            Ok(n) => {
                if inbound.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    debug!("{} inbound receiver gone", name);
                    break;
                }
            }
            Err(e) => {
                warn!("{} read error: {}", name, e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}
