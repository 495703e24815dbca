//! Session actor: one task owns each [`LinkSession`] and serialises every
//! input to it through a bounded inbox.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use packet_bbs_core::{Control, Frame};

use crate::app::{Application, ConnectDecision, Response, SessionContext};
use crate::directory::SessionKey;
use crate::event::{DisconnectReason, LinkEvent};
use crate::scheduler::{DeliveryEntry, DeliveryMode};
use crate::service::ChannelContext;
use crate::session::{Action, LinkSession, SessionParams, SessionState};
use crate::LinkError;

pub(crate) enum SessionCommand {
    Frame(Frame),
    Connect,
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        drain: bool,
    },
    IdleTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// V(S) and V(R) of the link.
    pub send_sequence: u8,
    pub receive_sequence: u8,
    pub last_activity: Instant,
    /// Set once the session has finished.
    pub closed: Option<DisconnectReason>,
}

/// Cloneable reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    key: SessionKey,
    tx: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Generation id, unique per directory.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn last_activity(&self) -> Instant {
        self.status.borrow().last_activity
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.status.borrow().closed.is_some()
    }

    /// Hand a received frame to the session without waiting. A full inbox
    /// drops the frame; the peer's retry covers it. Gives the frame back if
    /// the session has already finished.
    pub(crate) fn offer_frame(&self, frame: Frame) -> Result<(), Frame> {
        match self.tx.try_send(SessionCommand::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} inbox full, dropping frame", self.key);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(SessionCommand::Frame(frame))) => Err(frame),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        }
    }

    async fn command(&self, command: SessionCommand) -> Result<(), LinkError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| LinkError::SessionClosed)
    }

    pub(crate) async fn connect(&self) -> Result<(), LinkError> {
        self.command(SessionCommand::Connect).await
    }

    /// Queue a payload for acknowledged delivery.
    pub async fn send(&self, payload: Bytes) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Send { payload, reply }).await?;
        rx.await.map_err(|_| LinkError::SessionClosed)?
    }

    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.command(SessionCommand::Disconnect { drain: false }).await
    }

    /// Disconnect after everything queued so far has been acknowledged.
    pub async fn disconnect_after_delivery(&self) -> Result<(), LinkError> {
        self.command(SessionCommand::Disconnect { drain: true }).await
    }

    pub(crate) fn idle_timeout(&self) {
        if self.tx.try_send(SessionCommand::IdleTimeout).is_err() {
            debug!("{} could not take idle timeout", self.key);
        }
    }

    /// Wait for CONNECTED, or for the reason the session ended instead.
    pub async fn wait_connected(&self) -> Result<(), LinkError> {
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if current.state == SessionState::Connected {
                return Ok(());
            }
            if let Some(reason) = current.closed {
                return Err(match reason {
                    DisconnectReason::Refused => LinkError::Refused,
                    DisconnectReason::HandshakeTimeout => LinkError::HandshakeTimeout,
                    DisconnectReason::DeliveryTimeout => LinkError::DeliveryTimeout,
                    _ => LinkError::SessionClosed,
                });
            }
            if status.changed().await.is_err() {
                return Err(LinkError::SessionClosed);
            }
        }
    }

    /// Wait until the session has finished.
    pub async fn wait_closed(&self) -> DisconnectReason {
        let mut status = self.status.clone();
        loop {
            if let Some(reason) = status.borrow_and_update().closed {
                return reason;
            }
            if status.changed().await.is_err() {
                return status.borrow().closed.unwrap_or(DisconnectReason::ChannelShutdown);
            }
        }
    }

    /// A handle whose commands are swallowed by a bare task.
    #[cfg(test)]
    pub(crate) fn detached(id: u64, key: SessionKey) -> Self {
        let (tx, mut rx) = mpsc::channel(8);
        let (status_tx, status) = watch::channel(SessionStatus {
            state: SessionState::Disconnected,
            send_sequence: 0,
            receive_sequence: 0,
            last_activity: Instant::now(),
            closed: None,
        });
        tokio::spawn(async move {
            while rx.recv().await.is_some() {}
            drop(status_tx);
        });
        Self { id, key, tx, status }
    }
}

/// Start the actor for a new session and return its handle.
pub(crate) fn spawn_session(ctx: Arc<ChannelContext>, key: SessionKey, id: u64) -> SessionHandle {
    let link = &ctx.config.link;
    let now = Instant::now();
    let (tx, inbox) = mpsc::channel(link.session_inbox);
    let (on_air_tx, on_air) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(SessionStatus {
        state: SessionState::Disconnected,
        send_sequence: 0,
        receive_sequence: 0,
        last_activity: now,
        closed: None,
    });
    let actor = SessionActor {
        id,
        session: LinkSession::new(key.local, key.remote, SessionParams::from_config(link), now),
        app_ctx: SessionContext {
            key: key.clone(),
            pid: packet_bbs_core::ProtocolId::Text,
            originated: false,
        },
        key: key.clone(),
        ctx: ctx.clone(),
        inbox,
        on_air_tx,
        on_air,
        status: status_tx,
        app: None,
        was_connected: false,
        closed: None,
    };
    tokio::spawn(actor.run());
    SessionHandle { id, key, tx, status }
}

enum Input {
    Command(SessionCommand),
    OnAir(Frame),
    Timer,
    Shutdown,
}

struct SessionActor {
    id: u64,
    key: SessionKey,
    ctx: Arc<ChannelContext>,
    session: LinkSession,
    inbox: mpsc::Receiver<SessionCommand>,
    /// The scheduler reports our acknowledged-mode frames here once written.
    on_air_tx: mpsc::UnboundedSender<Frame>,
    on_air: mpsc::UnboundedReceiver<Frame>,
    status: watch::Sender<SessionStatus>,
    app: Option<Arc<dyn Application>>,
    app_ctx: SessionContext,
    was_connected: bool,
    closed: Option<DisconnectReason>,
}

impl SessionActor {
    async fn run(mut self) {
        let cancel = self.ctx.cancel.clone();
        loop {
            let deadline = self.session.next_deadline();
            let input = tokio::select! {
                _ = cancel.cancelled() => Input::Shutdown,
                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => Input::Command(cmd),
                    None => Input::Shutdown,
                },
                Some(frame) = self.on_air.recv() => Input::OnAir(frame),
                _ = async {
                    if let Some(deadline) = deadline {
                        sleep_until(deadline).await
                    }
                }, if deadline.is_some() => Input::Timer,
            };

            let now = Instant::now();
            let actions = match input {
                Input::Command(cmd) => self.command(cmd, now),
                Input::OnAir(frame) => {
                    self.session.on_air(&frame, now);
                    continue;
                }
                Input::Timer => self.session.poll_timers(now),
                Input::Shutdown => self.session.shutdown(),
            };
            self.apply(actions).await;
            self.publish();
            if self.closed.is_some() {
                break;
            }
        }

        self.ctx.directory.remove(&self.key, self.id).await;
        let key = self.key.clone();
        let dropped = self
            .ctx
            .queue
            .retract(|e| e.mode == DeliveryMode::RequiresAck && e.owner.as_ref() == Some(&key))
            .await;
        debug!("Session {} #{} finished, {} queued frames dropped", self.key, self.id, dropped);
    }

    fn command(&mut self, cmd: SessionCommand, now: Instant) -> Vec<Action> {
        match cmd {
            SessionCommand::Frame(frame) => {
                trace!("{} RX {}", self.key, frame);
                if let Some(pid) = frame.pid {
                    self.app_ctx.pid = pid;
                }
                self.session.handle_frame(&frame, now)
            }
            SessionCommand::Connect => {
                self.app_ctx.originated = true;
                self.session.originate(now)
            }
            SessionCommand::Send { payload, reply } => match self.session.send(payload, now) {
                Some(actions) => {
                    let _ = reply.send(Ok(()));
                    actions
                }
                None => {
                    let _ = reply.send(Err(LinkError::NotConnected(self.key.clone())));
                    Vec::new()
                }
            },
            SessionCommand::Disconnect { drain: true } => self.session.disconnect_when_drained(now),
            SessionCommand::Disconnect { drain: false } => self.session.disconnect(now),
            SessionCommand::IdleTimeout => {
                let idle = self.ctx.config.link.idle_timeout;
                if now.saturating_duration_since(self.session.last_activity()) >= idle {
                    info!("{} idle for {:?}, closing", self.key, idle);
                    self.session.idle_timeout()
                } else {
                    Vec::new()
                }
            }
        }
    }

    async fn resolve_app(&mut self) -> Option<Arc<dyn Application>> {
        if self.app.is_none() {
            self.app = self
                .ctx
                .applications
                .resolve(&self.key.channel, self.key.local)
                .await;
        }
        self.app.clone()
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut pending = VecDeque::from(actions);
        while let Some(action) = pending.pop_front() {
            let now = Instant::now();
            match action {
                Action::Transmit { frame, mode, attempt } => {
                    let on_air = (mode == DeliveryMode::RequiresAck).then(|| self.on_air_tx.clone());
                    self.ctx
                        .queue
                        .enqueue(DeliveryEntry {
                            frame,
                            mode,
                            attempt,
                            owner: Some(self.key.clone()),
                            on_air,
                        })
                        .await;
                }
                Action::Deliver(payload) => {
                    let response = match self.resolve_app().await {
                        Some(app) => app.handle_received_message(&self.app_ctx, payload).await,
                        None => {
                            debug!("{} has no application, {} bytes dropped", self.key, payload.len());
                            Response::Nothing
                        }
                    };
                    pending.extend(self.respond(response, now));
                }
                Action::Acked(seqs) => {
                    let key = self.key.clone();
                    self.ctx
                        .queue
                        .retract(|e| {
                            e.mode == DeliveryMode::RequiresAck
                                && e.owner.as_ref() == Some(&key)
                                && e.frame
                                    .control
                                    .send_sequence()
                                    .is_some_and(|ns| seqs.contains(&ns))
                        })
                        .await;
                }
                Action::ConnectRequest => {
                    let decision = match self.resolve_app().await {
                        Some(app) => app.decision_on_connection_request(&self.app_ctx).await,
                        None => {
                            info!("{} no application for {}, refusing", self.key, self.key.local);
                            ConnectDecision::Reject
                        }
                    };
                    let accept = decision == ConnectDecision::Accept;
                    pending.extend(self.session.answer_connect(accept, now));
                }
                Action::Connected => {
                    self.was_connected = true;
                    self.publish();
                    let key = self.key.clone();
                    self.ctx
                        .queue
                        .retract(|e| {
                            e.owner.as_ref() == Some(&key) && e.frame.control == Control::Connect
                        })
                        .await;
                    let _ = self.ctx.events.send(LinkEvent::Connected(self.key.clone()));
                    if let Some(app) = self.resolve_app().await {
                        let response = app.on_connected(&self.app_ctx).await;
                        pending.extend(self.respond(response, now));
                    }
                }
                Action::DeliveryFailed { seq } => {
                    let _ = self.ctx.events.send(LinkEvent::DeliveryFailed {
                        key: self.key.clone(),
                        seq,
                    });
                }
                Action::Closed(reason) => {
                    self.closed = Some(reason);
                    let key = self.key.clone();
                    let event = if self.app_ctx.originated && !self.was_connected {
                        LinkEvent::ConnectionFailed { key, reason }
                    } else {
                        LinkEvent::Disconnected { key, reason }
                    };
                    let _ = self.ctx.events.send(event);
                    if self.was_connected {
                        if let Some(app) = self.app.clone() {
                            app.on_disconnect(&self.app_ctx, reason).await;
                        }
                    }
                }
            }
        }
    }

    fn respond(&mut self, response: Response, now: Instant) -> Vec<Action> {
        match response {
            Response::Reply(payload) => self.session.send(payload, now).unwrap_or_default(),
            Response::ReplyAndDisconnect(payload) => {
                let mut actions = self.session.send(payload, now).unwrap_or_default();
                actions.extend(self.session.disconnect_when_drained(now));
                actions
            }
            Response::Disconnect => self.session.disconnect(now),
            Response::Nothing => Vec::new(),
        }
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            state: self.session.state(),
            send_sequence: self.session.send_sequence(),
            receive_sequence: self.session.expected_receive_sequence(),
            last_activity: self.session.last_activity(),
            closed: self.closed,
        });
    }
}
