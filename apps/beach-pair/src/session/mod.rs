//! Signaling orchestrator. A single task owns all pairing state; relay events,
//! peer events, user commands and reconnect timers reach it as messages on one
//! inbox and are handled strictly one at a time.

use std::sync::Arc;
use std::time::Duration;

use pair_proto::{
    CandidateData, PairBroadcast, PairMode, PairRequest, RoomId, SessionDescription,
    SignalingMessage, decode, encode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::{ConfigError, PairingConfig};
use crate::peer::{
    EngineFactory, EngineSink, Epoch, NegotiationState, PeerConnectionState, PeerEvent,
    PeerEventKind, PeerSession,
};
use crate::relay::{DisconnectReason, LinkId, RelayClient, RelayEvent, RelayNotice, RelaySink};

mod events;

pub use events::{
    DisconnectCause, PairingError, Phase, Role, SessionEvent, SessionSnapshot,
};

enum Inbox {
    Command(Command),
    Relay(RelayNotice),
    Peer(PeerEvent),
    ReconnectDue { token: u64 },
}

enum Command {
    RequestPairing {
        room: RoomId,
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Starts the orchestrator task. Dropping every clone of the returned handle
/// shuts it down.
pub fn spawn(
    config: PairingConfig,
    relay: Box<dyn RelayClient>,
    engines: Arc<dyn EngineFactory>,
) -> Result<(PairingHandle, mpsc::UnboundedReceiver<SessionEvent>), ConfigError> {
    let endpoint = config.relay_url()?;
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator {
        config,
        endpoint,
        relay,
        engines,
        inbox: inbox_tx.downgrade(),
        events: events_tx,
        phase: Phase::Disconnected,
        role: Role::None,
        partner_id: None,
        pending: None,
        peer: None,
        channel_open: false,
        link: None,
        next_link: 1,
        next_epoch: 1,
        reconnect: None,
        next_token: 1,
        awaiting_resume: false,
        held: Vec::new(),
    };
    tokio::spawn(orchestrator.run(inbox_rx));
    let handle = PairingHandle {
        shared: Arc::new(HandleShared { inbox: inbox_tx }),
    };
    Ok((handle, events_rx))
}

struct HandleShared {
    inbox: mpsc::UnboundedSender<Inbox>,
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        let _ = self
            .inbox
            .send(Inbox::Command(Command::Shutdown { reply: None }));
    }
}

/// Cloneable front door to a running orchestrator.
#[derive(Clone)]
pub struct PairingHandle {
    shared: Arc<HandleShared>,
}

impl PairingHandle {
    /// Validates the room id locally, then starts pairing. Only valid while
    /// disconnected.
    pub async fn request_pairing(&self, room_id: &str) -> Result<(), PairingError> {
        let room = RoomId::parse(room_id)?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestPairing { room, reply })?;
        rx.await.map_err(|_| PairingError::Closed)?
    }

    /// Cancels any pending reconnect and tears the session down.
    pub async fn disconnect(&self) -> Result<(), PairingError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply })?;
        rx.await.map_err(|_| PairingError::Closed)
    }

    /// Sends chat text over the peer data channel.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), PairingError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendMessage {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| PairingError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, PairingError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| PairingError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), PairingError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply: Some(reply) })?;
        rx.await.map_err(|_| PairingError::Closed)
    }

    fn send(&self, command: Command) -> Result<(), PairingError> {
        self.shared
            .inbox
            .send(Inbox::Command(command))
            .map_err(|_| PairingError::Closed)
    }
}

struct ReconnectTimer {
    token: u64,
    task: JoinHandle<()>,
}

struct Orchestrator {
    config: PairingConfig,
    endpoint: Url,
    relay: Box<dyn RelayClient>,
    engines: Arc<dyn EngineFactory>,
    // weak so the inbox closes once every handle is gone
    inbox: mpsc::WeakUnboundedSender<Inbox>,
    events: mpsc::UnboundedSender<SessionEvent>,
    phase: Phase,
    role: Role,
    partner_id: Option<String>,
    pending: Option<PairRequest>,
    peer: Option<PeerSession>,
    channel_open: bool,
    link: Option<LinkId>,
    next_link: LinkId,
    next_epoch: Epoch,
    reconnect: Option<ReconnectTimer>,
    next_token: u64,
    // set by a relay drop while a peer exists; cleared by the next `pair`
    awaiting_resume: bool,
    held: Vec<SignalingMessage>,
}

impl Orchestrator {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbox>) {
        while let Some(message) = inbox.recv().await {
            match message {
                Inbox::Command(command) => self.handle_command(command),
                Inbox::Relay(notice) => self.handle_relay(notice),
                Inbox::Peer(event) => self.handle_peer(event),
                Inbox::ReconnectDue { token } => self.handle_reconnect_due(token),
            }
            if self.phase == Phase::Closed {
                break;
            }
        }
        if self.phase != Phase::Closed {
            self.teardown();
            self.phase = Phase::Closed;
        }
        debug!(target = "beach_pair::session", "orchestrator stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestPairing { room, reply } => {
                let _ = reply.send(self.request_pairing(room));
            }
            Command::Disconnect { reply } => {
                self.reset(DisconnectCause::Requested);
                let _ = reply.send(());
            }
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                self.phase = Phase::Closed;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn request_pairing(&mut self, room: RoomId) -> Result<(), PairingError> {
        if self.phase != Phase::Disconnected {
            return Err(PairingError::AlreadyActive(self.phase));
        }
        info!(target = "beach_pair::session", room = %room, "pairing requested");
        self.pending = Some(PairRequest::new(self.config.client_id.clone(), &room));
        self.open_link();
        Ok(())
    }

    fn send_message(&mut self, text: String) -> Result<(), PairingError> {
        match &self.peer {
            Some(peer) if self.channel_open => {
                peer.send_text(text.clone());
                self.emit(SessionEvent::MessageSent(text));
                Ok(())
            }
            _ => Err(PairingError::ChannelNotOpen),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            role: self.role,
            partner_id: self.partner_id.clone(),
            pending: self.pending.clone(),
            negotiation: self
                .peer
                .as_ref()
                .map_or(NegotiationState::Idle, PeerSession::state),
            channel_open: self.channel_open,
            link: self.link,
            epoch: self.peer.as_ref().map(PeerSession::epoch),
        }
    }

    fn open_link(&mut self) {
        let link = self.next_link;
        self.next_link += 1;
        self.link = Some(link);
        let inbox = self.inbox.clone();
        let sink = RelaySink::new(link, move |notice| {
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Inbox::Relay(notice));
            }
        });
        self.phase = Phase::Connecting;
        self.emit(SessionEvent::Connecting {
            url: self.endpoint.to_string(),
        });
        self.relay.connect(&self.endpoint, sink);
    }

    fn release_link(&mut self) {
        self.relay.disconnect();
        self.link = None;
    }

    fn handle_relay(&mut self, notice: RelayNotice) {
        if self.link != Some(notice.link) {
            trace!(
                target = "beach_pair::session",
                link = notice.link,
                current = ?self.link,
                "ignoring event from replaced relay link"
            );
            return;
        }
        match notice.event {
            RelayEvent::Connected => self.on_relay_connected(),
            RelayEvent::Message(bytes) => self.on_relay_message(&bytes),
            RelayEvent::ConnectFailed(reason) => {
                warn!(target = "beach_pair::session", reason = %reason, "relay connect failed");
                self.on_relay_lost();
            }
            RelayEvent::Disconnected(DisconnectReason::Error) => {
                warn!(target = "beach_pair::session", "relay link dropped");
                self.on_relay_lost();
            }
            RelayEvent::Disconnected(DisconnectReason::Normal) => {
                debug!(target = "beach_pair::session", "relay link closed on request");
                self.reset(DisconnectCause::Requested);
            }
        }
    }

    fn on_relay_connected(&mut self) {
        self.emit(SessionEvent::RelayConnected);
        if let Some(request) = self.pending.clone() {
            let room_id = request.room_id.clone();
            let reconnect = request.reconnect;
            if self.send_frame(&SignalingMessage::PairRequest(request)) {
                self.emit(SessionEvent::PairRequestSent { room_id, reconnect });
            }
        }
        self.phase = match &self.peer {
            Some(peer) => Phase::Paired(peer.role()),
            None => Phase::AwaitingPartner,
        };
    }

    fn on_relay_lost(&mut self) {
        self.release_link();
        if self.peer.is_some() {
            self.awaiting_resume = true;
        }
        if self.pending.is_none() {
            self.phase = Phase::Disconnected;
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_reconnect();
        let token = self.next_token;
        self.next_token += 1;
        let delay = self.config.reconnect_delay;
        let inbox = self.inbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Inbox::ReconnectDue { token });
            }
        });
        self.reconnect = Some(ReconnectTimer { token, task });
        self.phase = Phase::Reconnecting;
        info!(
            target = "beach_pair::session",
            delay_ms = saturating_millis(delay),
            "scheduling relay reconnect"
        );
        self.emit(SessionEvent::Reconnecting { delay });
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.task.abort();
        }
    }

    fn handle_reconnect_due(&mut self, token: u64) {
        match &self.reconnect {
            Some(timer) if timer.token == token => {}
            _ => {
                trace!(target = "beach_pair::session", token, "ignoring stale reconnect timer");
                return;
            }
        }
        self.reconnect = None;
        if self.phase != Phase::Reconnecting {
            return;
        }
        let Some(pending) = self.pending.as_mut() else {
            self.phase = Phase::Disconnected;
            return;
        };
        pending.reconnect = true;
        debug!(target = "beach_pair::session", "reconnecting to relay");
        self.open_link();
    }

    fn on_relay_message(&mut self, bytes: &[u8]) {
        let message = match decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    target = "beach_pair::session",
                    error = %err,
                    len = bytes.len(),
                    "discarding relay frame"
                );
                return;
            }
        };
        trace!(target = "beach_pair::session", kind = %message.kind(), "relay frame");
        match message {
            SignalingMessage::Full => {
                warn!(target = "beach_pair::session", "room is full");
                self.emit(SessionEvent::RoomFull);
                self.reset(DisconnectCause::RoomFull);
            }
            SignalingMessage::PairBroadcast(broadcast) => self.on_pair(broadcast),
            SignalingMessage::PairRequest(_) => {
                warn!(target = "beach_pair::session", "relay echoed a pair request; ignoring");
            }
            SignalingMessage::Description(desc) => self.on_remote_description(desc),
            SignalingMessage::Candidate(candidate) => self.on_remote_candidate(candidate),
            SignalingMessage::Unpair => {
                info!(target = "beach_pair::session", "remote partner manually disconnected");
                self.emit(SessionEvent::PartnerUnpaired);
            }
        }
    }

    fn on_pair(&mut self, broadcast: PairBroadcast) {
        let mode = broadcast.mode;
        let resumable = broadcast.is_reconnect()
            && self.partner_id.as_deref() == Some(broadcast.partner_id.as_str())
            && self.peer.as_ref().is_some_and(|peer| peer.role() == mode);
        self.awaiting_resume = false;
        if resumable {
            info!(
                target = "beach_pair::session",
                partner = %broadcast.partner_id,
                mode = %mode,
                held = self.held.len(),
                "resuming existing peer session"
            );
            self.phase = Phase::Paired(mode);
            self.emit(SessionEvent::Paired {
                partner_id: broadcast.partner_id,
                mode,
                resumed: true,
            });
            for message in std::mem::take(&mut self.held) {
                self.relay_peer_frame(message);
            }
            return;
        }

        if !self.held.is_empty() {
            debug!(
                target = "beach_pair::session",
                held = self.held.len(),
                "discarding peer frames of the replaced session"
            );
            self.held.clear();
        }

        if let Some(mut previous) = self.peer.take() {
            debug!(
                target = "beach_pair::session",
                epoch = previous.epoch(),
                "replacing peer session"
            );
            previous.close();
        }
        self.channel_open = false;

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let inbox = self.inbox.clone();
        let sink = EngineSink::new(epoch, move |event| {
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Inbox::Peer(event));
            }
        });
        let engines = Arc::clone(&self.engines);
        let peer = match mode {
            PairMode::Master => {
                PeerSession::create_as_master(epoch, engines, sink, self.config.channel_label.clone())
            }
            PairMode::Slave => PeerSession::create_as_slave(epoch, engines, sink),
        };
        info!(
            target = "beach_pair::session",
            partner = %broadcast.partner_id,
            mode = %mode,
            epoch,
            "paired"
        );
        self.peer = Some(peer);
        self.role = Role::from(mode);
        self.partner_id = Some(broadcast.partner_id.clone());
        self.phase = Phase::Paired(mode);
        self.emit(SessionEvent::Paired {
            partner_id: broadcast.partner_id,
            mode,
            resumed: false,
        });
    }

    fn on_remote_description(&mut self, desc: SessionDescription) {
        match &self.peer {
            Some(peer) => {
                debug!(target = "beach_pair::session", kind = %desc.kind, "applying remote description");
                peer.apply_remote_description(desc);
            }
            None => warn!(
                target = "beach_pair::session",
                kind = %desc.kind,
                "remote description without a peer session; discarding"
            ),
        }
    }

    fn on_remote_candidate(&mut self, candidate: CandidateData) {
        match &self.peer {
            Some(peer) => {
                peer.add_remote_candidate(candidate);
                self.emit(SessionEvent::CandidateAdded);
            }
            None => warn!(
                target = "beach_pair::session",
                "remote candidate without a peer session; discarding"
            ),
        }
    }

    fn handle_peer(&mut self, event: PeerEvent) {
        if self.peer.as_ref().map(PeerSession::epoch) != Some(event.epoch) {
            trace!(
                target = "beach_pair::session",
                epoch = event.epoch,
                "ignoring event from retired peer session"
            );
            return;
        }
        match event.kind {
            PeerEventKind::LocalDescriptionReady(desc) => {
                self.relay_peer_frame(SignalingMessage::Description(desc));
            }
            PeerEventKind::LocalCandidate(candidate) => {
                self.relay_peer_frame(SignalingMessage::Candidate(candidate));
            }
            PeerEventKind::DataChannelOpen(label) => {
                self.channel_open = true;
                self.emit(SessionEvent::DataChannelOpen { label });
            }
            PeerEventKind::DataChannelMessage(text) => {
                self.emit(SessionEvent::MessageReceived(text));
            }
            PeerEventKind::ConnectionState(state) => {
                if let Some(peer) = &self.peer {
                    peer.note_connection_state(state);
                }
                if matches!(state, PeerConnectionState::Failed | PeerConnectionState::Closed) {
                    self.channel_open = false;
                }
                self.emit(SessionEvent::PeerStateChanged(state));
            }
            PeerEventKind::NegotiationFailed(err) => {
                warn!(target = "beach_pair::session", error = %err, "negotiation failed");
                self.emit(SessionEvent::NegotiationFailed(err));
            }
        }
    }

    /// Sends a locally produced description or candidate. While a relay drop
    /// is unresolved, or when the send fails, the frame is held for the
    /// resumed pairing instead.
    fn relay_peer_frame(&mut self, message: SignalingMessage) {
        if self.awaiting_resume || !self.send_frame(&message) {
            trace!(
                target = "beach_pair::session",
                kind = %message.kind(),
                "holding peer frame until the pairing resumes"
            );
            self.held.push(message);
            return;
        }
        match &message {
            SignalingMessage::Description(desc) => {
                self.emit(SessionEvent::DescriptionSent(desc.kind));
            }
            SignalingMessage::Candidate(_) => self.emit(SessionEvent::CandidateSent),
            _ => {}
        }
    }

    fn send_frame(&mut self, message: &SignalingMessage) -> bool {
        let kind = message.kind();
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(err) => {
                error!(target = "beach_pair::session", error = %err, "failed to encode frame");
                return false;
            }
        };
        match self.relay.send(frame) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "beach_pair::session",
                    kind = %kind,
                    error = %err,
                    "relay send failed"
                );
                false
            }
        }
    }

    /// Clears every piece of session state. Returns whether anything was
    /// active.
    fn teardown(&mut self) -> bool {
        let was_active = self.phase != Phase::Disconnected
            || self.peer.is_some()
            || self.pending.is_some();
        self.cancel_reconnect();
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        self.release_link();
        self.awaiting_resume = false;
        self.held.clear();
        self.pending = None;
        self.partner_id = None;
        self.role = Role::None;
        self.channel_open = false;
        self.phase = Phase::Disconnected;
        was_active
    }

    fn reset(&mut self, cause: DisconnectCause) {
        if self.teardown() {
            info!(target = "beach_pair::session", cause = ?cause, "session reset");
            self.emit(SessionEvent::Disconnected { cause });
        }
    }
}

fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturate_instead_of_wrapping() {
        assert_eq!(saturating_millis(Duration::from_secs(3)), 3_000);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
}
