//! Connected-mode link state machine for one (channel, peer) pair.
//!
//! [`LinkSession`] is synchronous and takes the current time as an argument.
//! Every input returns the [`Action`]s its owner has to carry out: frames to
//! queue, payloads to hand to the application, state changes to publish.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::time::Instant;

use packet_bbs_core::{Callsign, Control, Frame, ProtocolId, SEQ_MODULUS};

use crate::event::DisconnectReason;
use crate::scheduler::DeliveryMode;
use crate::LinkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    ConnectPending,
    Connected,
    DisconnectPending,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::ConnectPending => "CONNECT_PENDING",
            SessionState::Connected => "CONNECTED",
            SessionState::DisconnectPending => "DISCONNECT_PENDING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transmit {
        frame: Frame,
        mode: DeliveryMode,
        attempt: u32,
    },
    /// In-order, de-duplicated payload for the application.
    Deliver(Bytes),
    /// Outstanding I frames with these sequence numbers were acknowledged.
    Acked(Vec<u8>),
    /// A peer asked to connect; answer with [`LinkSession::answer_connect`].
    ConnectRequest,
    Connected,
    DeliveryFailed { seq: u8 },
    /// The session reached DISCONNECTED and is finished.
    Closed(DisconnectReason),
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub window: u8,
    pub max_retries: u32,
    pub retry_time: Duration,
    pub info_len: usize,
    pub pid: ProtocolId,
}

impl SessionParams {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            window: config.window_size,
            max_retries: config.max_delivery_attempts,
            retry_time: config.delivery_retry_time,
            info_len: config.info_len(),
            pid: ProtocolId::Text,
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    seq: u8,
    frame: Frame,
    retries: u32,
    /// Unset while the latest copy is still waiting in the queue.
    deadline: Option<Instant>,
}

/// Retry state of a pending SABM or DISC.
#[derive(Debug)]
struct Handshake {
    retries: u32,
    deadline: Option<Instant>,
}

fn seq_add(a: u8, n: u8) -> u8 {
    (a + n) % SEQ_MODULUS
}

/// Distance from `from` forward to `to`, modulo 8.
fn seq_offset(from: u8, to: u8) -> u8 {
    (to + SEQ_MODULUS - from) % SEQ_MODULUS
}

#[derive(Debug)]
pub struct LinkSession {
    local: Callsign,
    remote: Callsign,
    params: SessionParams,
    state: SessionState,
    /// V(S): next sequence number to send.
    send_seq: u8,
    /// V(A): oldest unacknowledged sequence number.
    ack_seq: u8,
    /// V(R): next sequence number expected from the peer.
    recv_seq: u8,
    outstanding: VecDeque<Outstanding>,
    backlog: VecDeque<Bytes>,
    reject_sent: bool,
    peer_busy: bool,
    handshake: Option<Handshake>,
    close_when_drained: bool,
    last_activity: Instant,
}

impl LinkSession {
    pub fn new(local: Callsign, remote: Callsign, params: SessionParams, now: Instant) -> Self {
        Self {
            local,
            remote,
            params,
            state: SessionState::Disconnected,
            send_seq: 0,
            ack_seq: 0,
            recv_seq: 0,
            outstanding: VecDeque::new(),
            backlog: VecDeque::new(),
            reject_sent: false,
            peer_busy: false,
            handshake: None,
            close_when_drained: false,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn send_sequence(&self) -> u8 {
        self.send_seq
    }

    pub fn expected_receive_sequence(&self) -> u8 {
        self.recv_seq
    }

    pub fn unacknowledged(&self) -> usize {
        self.outstanding.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Earliest pending retry deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        let frames = self.outstanding.iter().filter_map(|o| o.deadline);
        self.handshake.iter().filter_map(|h| h.deadline).chain(frames).min()
    }

    /// A queued copy of `frame` has been written to the channel. Its retry
    /// timer runs from here, not from when it was queued.
    pub fn on_air(&mut self, frame: &Frame, now: Instant) {
        let deadline = Some(now + self.params.retry_time);
        match frame.control {
            Control::Information { ns, .. } => {
                if let Some(o) = self
                    .outstanding
                    .iter_mut()
                    .find(|o| o.seq == ns && o.frame == *frame)
                {
                    o.deadline = deadline;
                }
            }
            Control::Connect if self.state == SessionState::ConnectPending => {
                if let Some(h) = self.handshake.as_mut() {
                    h.deadline = deadline;
                }
            }
            Control::Disconnect if self.state == SessionState::DisconnectPending => {
                if let Some(h) = self.handshake.as_mut() {
                    h.deadline = deadline;
                }
            }
            _ => {}
        }
    }

    fn frame(&self, control: Control, command: bool, poll_final: bool) -> Frame {
        Frame::new(self.remote, self.local, control, command, poll_final)
    }

    fn respond(&self, control: Control, final_bit: bool, out: &mut Vec<Action>) {
        out.push(Action::Transmit {
            frame: self.frame(control, false, final_bit),
            mode: DeliveryMode::FireAndForget,
            attempt: 0,
        });
    }

    fn reset_sequences(&mut self) {
        self.send_seq = 0;
        self.ack_seq = 0;
        self.recv_seq = 0;
        self.outstanding.clear();
        self.reject_sent = false;
        self.peer_busy = false;
    }

    fn close(&mut self, reason: DisconnectReason, out: &mut Vec<Action>) {
        info!("{}<->{} {} -> DISCONNECTED ({})", self.local, self.remote, self.state, reason);
        self.state = SessionState::Disconnected;
        self.handshake = None;
        self.backlog.clear();
        self.reset_sequences();
        out.push(Action::Closed(reason));
    }

    fn become_connected(&mut self, out: &mut Vec<Action>) {
        info!("{}<->{} {} -> CONNECTED", self.local, self.remote, self.state);
        self.state = SessionState::Connected;
        self.handshake = None;
        out.push(Action::Connected);
    }

    /// Start a locally originated connection.
    pub fn originate(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.state != SessionState::Disconnected {
            return out;
        }
        self.last_activity = now;
        self.reset_sequences();
        self.state = SessionState::ConnectPending;
        self.handshake = Some(Handshake {
            retries: 0,
            deadline: None,
        });
        out.push(Action::Transmit {
            frame: self.frame(Control::Connect, true, true),
            mode: DeliveryMode::RequiresAck,
            attempt: 0,
        });
        out
    }

    /// Answer a CONNECT that arrived while DISCONNECTED.
    pub fn answer_connect(&mut self, accept: bool, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.last_activity = now;
        if accept {
            self.reset_sequences();
            self.respond(Control::UnnumberedAck, true, &mut out);
            self.become_connected(&mut out);
        } else {
            self.respond(Control::DisconnectedMode, true, &mut out);
            self.close(DisconnectReason::Refused, &mut out);
        }
        out
    }

    /// Queue an application payload for sequenced delivery.
    ///
    /// Returns `None` when the session cannot carry data.
    pub fn send(&mut self, payload: Bytes, now: Instant) -> Option<Vec<Action>> {
        if !matches!(self.state, SessionState::Connected | SessionState::ConnectPending) {
            return None;
        }
        self.last_activity = now;
        let chunk = self.params.info_len;
        let mut rest = payload;
        while rest.len() > chunk {
            self.backlog.push_back(rest.split_to(chunk));
        }
        if !rest.is_empty() {
            self.backlog.push_back(rest);
        }
        let mut out = Vec::new();
        self.pump(&mut out);
        Some(out)
    }

    fn pump(&mut self, out: &mut Vec<Action>) {
        if self.state != SessionState::Connected || self.peer_busy {
            return;
        }
        while self.outstanding.len() < self.params.window as usize {
            let Some(payload) = self.backlog.pop_front() else {
                break;
            };
            let seq = self.send_seq;
            let frame = Frame::information(
                self.remote,
                self.local,
                seq,
                self.recv_seq,
                false,
                self.params.pid,
                payload,
            );
            self.outstanding.push_back(Outstanding {
                seq,
                frame: frame.clone(),
                retries: 0,
                deadline: None,
            });
            self.send_seq = seq_add(seq, 1);
            out.push(Action::Transmit {
                frame,
                mode: DeliveryMode::RequiresAck,
                attempt: 0,
            });
        }
    }

    /// Begin a local disconnect.
    pub fn disconnect(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.last_activity = now;
        match self.state {
            SessionState::Connected => {
                self.backlog.clear();
                self.outstanding.clear();
                self.state = SessionState::DisconnectPending;
                self.handshake = Some(Handshake {
                    retries: 0,
                    deadline: None,
                });
                out.push(Action::Transmit {
                    frame: self.frame(Control::Disconnect, true, true),
                    mode: DeliveryMode::RequiresAck,
                    attempt: 0,
                });
            }
            SessionState::ConnectPending => self.close(DisconnectReason::Local, &mut out),
            SessionState::Disconnected | SessionState::DisconnectPending => {}
        }
        out
    }

    /// Disconnect once every queued payload has been acknowledged.
    pub fn disconnect_when_drained(&mut self, now: Instant) -> Vec<Action> {
        if self.outstanding.is_empty() && self.backlog.is_empty() {
            return self.disconnect(now);
        }
        self.close_when_drained = true;
        Vec::new()
    }

    /// Forced teardown after the idle bound: one DISC, no waiting.
    pub fn idle_timeout(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        if self.state == SessionState::Disconnected {
            return out;
        }
        if self.state == SessionState::Connected {
            out.push(Action::Transmit {
                frame: self.frame(Control::Disconnect, true, true),
                mode: DeliveryMode::FireAndForget,
                attempt: 0,
            });
        }
        self.close(DisconnectReason::IdleTimeout, &mut out);
        out
    }

    /// Channel teardown: drop to DISCONNECTED without sending anything.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.close(DisconnectReason::ChannelShutdown, &mut out);
        out
    }

    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        self.last_activity = now;
        let pf = frame.poll_final;

        match frame.control {
            Control::Connect => match self.state {
                SessionState::Disconnected => out.push(Action::ConnectRequest),
                SessionState::Connected => {
                    warn!(
                        "{}<->{} link reset by peer, {} unacknowledged frames lost",
                        self.local,
                        self.remote,
                        self.outstanding.len()
                    );
                    self.reset_sequences();
                    self.respond(Control::UnnumberedAck, pf, &mut out);
                    self.pump(&mut out);
                }
                SessionState::ConnectPending => {
                    // both ends connected at once
                    self.respond(Control::UnnumberedAck, pf, &mut out);
                    self.become_connected(&mut out);
                    self.pump(&mut out);
                }
                SessionState::DisconnectPending => {
                    self.respond(Control::DisconnectedMode, pf, &mut out);
                }
            },
            Control::Disconnect => match self.state {
                SessionState::Connected | SessionState::ConnectPending => {
                    self.respond(Control::UnnumberedAck, pf, &mut out);
                    self.close(DisconnectReason::Remote, &mut out);
                }
                SessionState::DisconnectPending => {
                    self.respond(Control::UnnumberedAck, pf, &mut out);
                    self.close(DisconnectReason::Local, &mut out);
                }
                SessionState::Disconnected => {
                    self.respond(Control::DisconnectedMode, pf, &mut out);
                }
            },
            Control::UnnumberedAck => match self.state {
                SessionState::ConnectPending => {
                    self.become_connected(&mut out);
                    self.pump(&mut out);
                }
                SessionState::DisconnectPending => self.close(DisconnectReason::Local, &mut out),
                _ => debug!("{}<->{} stray UA in {}", self.local, self.remote, self.state),
            },
            Control::DisconnectedMode => match self.state {
                SessionState::ConnectPending => self.close(DisconnectReason::Refused, &mut out),
                SessionState::DisconnectPending => self.close(DisconnectReason::Local, &mut out),
                SessionState::Connected => self.close(DisconnectReason::Remote, &mut out),
                SessionState::Disconnected => {}
            },
            Control::FrameReject => {
                warn!("{}<->{} peer rejected a frame, disconnecting", self.local, self.remote);
                out.extend(self.disconnect(now));
            }
            Control::Information { ns, nr } => {
                if self.state != SessionState::Connected {
                    if self.state == SessionState::Disconnected && frame.command && pf {
                        self.respond(Control::DisconnectedMode, true, &mut out);
                    }
                    return out;
                }
                self.process_ack(nr, &mut out);
                self.receive(ns, frame.payload.clone(), pf && frame.command, &mut out);
                self.pump(&mut out);
                self.check_drained(now, &mut out);
            }
            Control::ReceiveReady { nr }
            | Control::ReceiveNotReady { nr }
            | Control::Reject { nr } => {
                if self.state != SessionState::Connected {
                    return out;
                }
                self.peer_busy = matches!(frame.control, Control::ReceiveNotReady { .. });
                if self.process_ack(nr, &mut out) && matches!(frame.control, Control::Reject { .. }) {
                    self.retransmit_all(&mut out);
                }
                if frame.command && pf {
                    self.respond(Control::ReceiveReady { nr: self.recv_seq }, true, &mut out);
                }
                self.pump(&mut out);
                self.check_drained(now, &mut out);
            }
            Control::Unproto => {}
        }
        out
    }

    /// Acknowledge outstanding frames before `nr`. Returns false for an N(R)
    /// outside the window.
    fn process_ack(&mut self, nr: u8, out: &mut Vec<Action>) -> bool {
        let in_flight = seq_offset(self.ack_seq, self.send_seq);
        let acked = seq_offset(self.ack_seq, nr);
        if acked > in_flight {
            debug!(
                "{}<->{} sequence error: N(R)={} outside V(A)={}..V(S)={}",
                self.local, self.remote, nr, self.ack_seq, self.send_seq
            );
            return false;
        }
        if acked == 0 {
            return true;
        }
        let seqs: Vec<u8> = self
            .outstanding
            .drain(..acked as usize)
            .map(|o| o.seq)
            .collect();
        self.ack_seq = nr;
        out.push(Action::Acked(seqs));
        true
    }

    fn receive(&mut self, ns: u8, payload: Bytes, poll: bool, out: &mut Vec<Action>) {
        let offset = seq_offset(self.recv_seq, ns);
        if offset == 0 {
            out.push(Action::Deliver(payload));
            self.recv_seq = seq_add(self.recv_seq, 1);
            self.reject_sent = false;
            self.respond(Control::ReceiveReady { nr: self.recv_seq }, poll, out);
            return;
        }

        // Go-back-N: anything but V(R) is dropped. The peer's window may be
        // wider than ours, so a frame that looks ahead can be an old
        // retransmission; only the peer resending from N(R) is trusted.
        if offset < self.params.window && !self.reject_sent {
            debug!(
                "{}<->{} sequence gap: got N(S)={} expecting {}",
                self.local, self.remote, ns, self.recv_seq
            );
            self.reject_sent = true;
            self.respond(Control::Reject { nr: self.recv_seq }, poll, out);
        } else if offset < self.params.window {
            if poll {
                self.respond(Control::ReceiveReady { nr: self.recv_seq }, true, out);
            }
        } else {
            debug!(
                "{}<->{} duplicate N(S)={}, re-acknowledging {}",
                self.local, self.remote, ns, self.recv_seq
            );
            self.respond(Control::ReceiveReady { nr: self.recv_seq }, poll, out);
        }
    }

    fn retransmit_all(&mut self, out: &mut Vec<Action>) {
        for o in self.outstanding.iter_mut() {
            o.deadline = None;
            out.push(Action::Transmit {
                frame: o.frame.clone(),
                mode: DeliveryMode::RequiresAck,
                attempt: o.retries,
            });
        }
    }

    fn check_drained(&mut self, now: Instant, out: &mut Vec<Action>) {
        if self.close_when_drained && self.outstanding.is_empty() && self.backlog.is_empty() {
            self.close_when_drained = false;
            out.extend(self.disconnect(now));
        }
    }

    /// Fire every retry timer that is due.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        let max = self.params.max_retries;
        let due = |deadline: Option<Instant>| deadline.is_some_and(|d| d <= now);

        if let Some(handshake) = self.handshake.as_mut() {
            if due(handshake.deadline) {
                if handshake.retries >= max {
                    match self.state {
                        SessionState::ConnectPending => {
                            warn!("{}<->{} no answer to CONNECT", self.local, self.remote);
                            self.close(DisconnectReason::HandshakeTimeout, &mut out);
                        }
                        _ => self.close(DisconnectReason::Local, &mut out),
                    }
                    return out;
                }
                handshake.retries += 1;
                handshake.deadline = None;
                let attempt = handshake.retries;
                let control = if self.state == SessionState::ConnectPending {
                    Control::Connect
                } else {
                    Control::Disconnect
                };
                out.push(Action::Transmit {
                    frame: self.frame(control, true, true),
                    mode: DeliveryMode::RequiresAck,
                    attempt,
                });
            }
        }

        let mut failed = None;
        for o in self.outstanding.iter_mut().filter(|o| due(o.deadline)) {
            if o.retries >= max {
                failed = Some(o.seq);
                break;
            }
            o.retries += 1;
            o.deadline = None;
            debug!("{}<->{} retry {} of N(S)={}", self.local, self.remote, o.retries, o.seq);
            out.push(Action::Transmit {
                frame: o.frame.clone(),
                mode: DeliveryMode::RequiresAck,
                attempt: o.retries,
            });
        }

        if let Some(seq) = failed {
            warn!("{}<->{} N(S)={} never acknowledged", self.local, self.remote, seq);
            out.push(Action::DeliveryFailed { seq });
            out.push(Action::Transmit {
                frame: self.frame(Control::Disconnect, true, true),
                mode: DeliveryMode::FireAndForget,
                attempt: 0,
            });
            self.close(DisconnectReason::DeliveryTimeout, &mut out);
        }
        out
    }
}
