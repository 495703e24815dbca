#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Decoder, Encoder};

use packet_bbs_core::{Callsign, Control, Frame};
use packet_bbs_radio::{
    Application, ChannelConfig, KissCodec, KissFrame, LinkConfig, Response, SessionContext,
    SimulatedEther, SimulatedTransport, Transport,
};

pub const CHANNEL: &str = "vhf";

pub fn bbs() -> Callsign {
    "BBS".parse().unwrap()
}

pub fn user() -> Callsign {
    "N0CALL-1".parse().unwrap()
}

pub fn link_config() -> LinkConfig {
    LinkConfig {
        min_tx_pause: Duration::from_millis(500),
        ..Default::default()
    }
}

pub fn channel(local: Callsign, link: LinkConfig) -> ChannelConfig {
    let mut config = ChannelConfig::new(CHANNEL, vec![local]);
    config.link = link;
    config
}

/// Answers "mail" like a BBS shell, records everything it is given.
pub struct MailApp {
    pub received: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Application for MailApp {
    fn name(&self) -> &str {
        "mail"
    }

    async fn handle_received_message(&self, _ctx: &SessionContext, payload: Bytes) -> Response {
        let _ = self.received.send(payload.clone());
        if &payload[..] == b"mail" {
            Response::Reply(Bytes::from_static(b"Launching Mail\r\nmail> "))
        } else {
            Response::Nothing
        }
    }
}

pub fn mail_app() -> (Arc<MailApp>, mpsc::UnboundedReceiver<Bytes>) {
    let (received, rx) = mpsc::unbounded_channel();
    (Arc::new(MailApp { received }), rx)
}

/// Frames in a transport's write log, in order.
pub fn decode_written(written: &[(Instant, Bytes)]) -> Vec<Frame> {
    let mut codec = KissCodec::new(256);
    let mut frames = Vec::new();
    for (_, wire) in written {
        let mut buf = BytesMut::from(&wire[..]);
        while let Some(kiss) = codec.decode(&mut buf).unwrap() {
            frames.push(Frame::decode(&kiss.data).unwrap());
        }
    }
    frames
}

/// A hand-driven station on the ether that speaks raw frames.
pub struct RawPeer {
    pub call: Callsign,
    pub transport: Arc<SimulatedTransport>,
    inbound: mpsc::Receiver<Bytes>,
    codec: KissCodec,
    buffer: BytesMut,
}

impl RawPeer {
    pub async fn attach(ether: &SimulatedEther, call: Callsign) -> Self {
        let transport = ether.transport(&call.to_string());
        let (tx, inbound) = mpsc::channel(64);
        transport.connect(tx).await.unwrap();
        Self {
            call,
            transport,
            inbound,
            codec: KissCodec::new(256),
            buffer: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let mut wire = BytesMut::new();
        self.codec
            .encode(KissFrame::data(0, frame.encode().unwrap()), &mut wire)
            .unwrap();
        self.transport.write_bytes(&wire).await.unwrap();
    }

    pub async fn send_control(&mut self, to: Callsign, control: Control, command: bool, pf: bool) {
        self.send(Frame::new(to, self.call, control, command, pf)).await;
    }

    /// Next frame addressed to this peer, or None after `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Frame> {
        timeout(wait, async {
            loop {
                if let Some(kiss) = self.codec.decode(&mut self.buffer).unwrap() {
                    let frame = Frame::decode(&kiss.data).unwrap();
                    if frame.destination == self.call {
                        return frame;
                    }
                    continue;
                }
                let chunk = self.inbound.recv().await.unwrap();
                self.buffer.extend_from_slice(&chunk);
            }
        })
        .await
        .ok()
    }

    pub async fn recv(&mut self) -> Frame {
        self.recv_within(Duration::from_secs(120))
            .await
            .expect("no frame within two minutes")
    }
}
