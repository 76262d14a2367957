//! One pairing epoch's peer connection. The negotiation engine sits behind
//! [`NegotiationEngine`]; a [`PeerSession`] drives it from a single worker
//! task so engine operations run in exactly the order they were requested.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pair_proto::{CandidateData, PairMode, SdpKind, SessionDescription};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

mod rtc;

pub use rtc::{RtcEngine, RtcEngineFactory, description_from_rtc, description_to_rtc};

pub type Epoch = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("{op} failed: {reason}")]
    Engine { op: &'static str, reason: String },
    #[error("unsupported session description type {0}")]
    UnsupportedType(String),
    #[error("{role} peer cannot apply a remote {kind}")]
    UnexpectedDescription { role: PairMode, kind: SdpKind },
    #[error("no data channel")]
    NoDataChannel,
}

impl NegotiationError {
    pub fn engine(op: &'static str, err: impl fmt::Display) -> Self {
        NegotiationError::Engine {
            op,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Where one epoch's negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    RoleAssigned,
    MasterOffering,
    AwaitingOffer,
    DescriptionsExchanged,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    /// Set locally; safe to send to the partner.
    LocalDescriptionReady(SessionDescription),
    LocalCandidate(CandidateData),
    DataChannelOpen(String),
    DataChannelMessage(String),
    ConnectionState(PeerConnectionState),
    NegotiationFailed(NegotiationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub epoch: Epoch,
    pub kind: PeerEventKind,
}

/// Callback target handed to an engine. Every event is stamped with the epoch
/// the engine was built for.
#[derive(Clone)]
pub struct EngineSink {
    epoch: Epoch,
    deliver: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl EngineSink {
    pub fn new(epoch: Epoch, deliver: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self {
            epoch,
            deliver: Arc::new(deliver),
        }
    }

    pub fn channel(epoch: Epoch) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(epoch, move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn local_candidate(&self, candidate: CandidateData) {
        self.emit(PeerEventKind::LocalCandidate(candidate));
    }

    pub fn data_channel_open(&self, label: impl Into<String>) {
        self.emit(PeerEventKind::DataChannelOpen(label.into()));
    }

    pub fn data_channel_message(&self, text: impl Into<String>) {
        self.emit(PeerEventKind::DataChannelMessage(text.into()));
    }

    pub fn connection_state(&self, state: PeerConnectionState) {
        self.emit(PeerEventKind::ConnectionState(state));
    }

    fn local_description_ready(&self, desc: SessionDescription) {
        self.emit(PeerEventKind::LocalDescriptionReady(desc));
    }

    fn negotiation_failed(&self, err: NegotiationError) {
        self.emit(PeerEventKind::NegotiationFailed(err));
    }

    fn emit(&self, kind: PeerEventKind) {
        (self.deliver)(PeerEvent {
            epoch: self.epoch,
            kind,
        });
    }
}

impl fmt::Debug for EngineSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSink")
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Peer-connection engine for one epoch. Asynchronous engine callbacks
/// (candidates, data channel, connection state) go to the [`EngineSink`] the
/// engine was created with.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_candidate(&self, candidate: &CandidateData) -> Result<(), NegotiationError>;
    async fn send_text(&self, text: &str) -> Result<(), NegotiationError>;
    async fn close(&self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        sink: EngineSink,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError>;
}

enum PeerOp {
    Offer { label: String },
    ApplyRemote(SessionDescription),
    AddCandidate(CandidateData),
    SendText(String),
    Close,
}

/// Owns one epoch's engine through its worker task.
pub struct PeerSession {
    epoch: Epoch,
    role: PairMode,
    ops: mpsc::UnboundedSender<PeerOp>,
    state: Arc<Mutex<NegotiationState>>,
    worker: JoinHandle<()>,
    closed: bool,
}

impl PeerSession {
    /// Builds the engine, opens the local data channel and starts the offer.
    pub fn create_as_master(
        epoch: Epoch,
        engines: Arc<dyn EngineFactory>,
        sink: EngineSink,
        label: impl Into<String>,
    ) -> Self {
        let session = Self::start(epoch, PairMode::Master, engines, sink);
        let _ = session.ops.send(PeerOp::Offer {
            label: label.into(),
        });
        session
    }

    /// Builds the engine and waits for the partner's offer.
    pub fn create_as_slave(epoch: Epoch, engines: Arc<dyn EngineFactory>, sink: EngineSink) -> Self {
        let session = Self::start(epoch, PairMode::Slave, engines, sink);
        *session.state.lock() = NegotiationState::AwaitingOffer;
        session
    }

    fn start(
        epoch: Epoch,
        role: PairMode,
        engines: Arc<dyn EngineFactory>,
        sink: EngineSink,
    ) -> Self {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(NegotiationState::RoleAssigned));
        let worker = tokio::spawn(run_worker(
            role,
            engines,
            sink,
            ops_rx,
            Arc::clone(&state),
        ));
        debug!(target = "beach_pair::peer", epoch, role = %role, "peer session started");
        Self {
            epoch,
            role,
            ops,
            state,
            worker,
            closed: false,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn role(&self) -> PairMode {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    /// Queues a remote offer or answer. Failures come back as
    /// `NegotiationFailed` events.
    pub fn apply_remote_description(&self, desc: SessionDescription) {
        self.enqueue(PeerOp::ApplyRemote(desc));
    }

    /// Queued in arrival order whatever the description state.
    pub fn add_remote_candidate(&self, candidate: CandidateData) {
        self.enqueue(PeerOp::AddCandidate(candidate));
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.enqueue(PeerOp::SendText(text.into()));
    }

    pub fn note_connection_state(&self, state: PeerConnectionState) {
        if state == PeerConnectionState::Connected {
            let mut current = self.state.lock();
            if *current != NegotiationState::Closed {
                *current = NegotiationState::Connected;
            }
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        *self.state.lock() = NegotiationState::Closed;
        if self.ops.send(PeerOp::Close).is_err() {
            self.worker.abort();
        }
        debug!(target = "beach_pair::peer", epoch = self.epoch, "peer session closed");
    }

    fn enqueue(&self, op: PeerOp) {
        if self.closed || self.ops.send(op).is_err() {
            trace!(
                target = "beach_pair::peer",
                epoch = self.epoch,
                "dropping operation for closed peer session"
            );
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(
    role: PairMode,
    engines: Arc<dyn EngineFactory>,
    sink: EngineSink,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    state: Arc<Mutex<NegotiationState>>,
) {
    let epoch = sink.epoch();
    let engine = match engines.create(sink.clone()).await {
        Ok(engine) => engine,
        Err(err) => {
            warn!(target = "beach_pair::peer", epoch, error = %err, "engine setup failed");
            sink.negotiation_failed(err);
            return;
        }
    };

    while let Some(op) = ops.recv().await {
        let result = match op {
            PeerOp::Offer { label } => {
                set_state(&state, NegotiationState::MasterOffering);
                start_offer(engine.as_ref(), &label).await.map(|offer| {
                    sink.local_description_ready(offer);
                })
            }
            PeerOp::ApplyRemote(desc) => {
                apply_remote(engine.as_ref(), role, desc, &sink, &state).await
            }
            PeerOp::AddCandidate(candidate) => {
                if let Err(err) = engine.add_candidate(&candidate).await {
                    warn!(
                        target = "beach_pair::peer",
                        epoch,
                        error = %err,
                        "remote candidate rejected"
                    );
                }
                Ok(())
            }
            PeerOp::SendText(text) => {
                if let Err(err) = engine.send_text(&text).await {
                    warn!(target = "beach_pair::peer", epoch, error = %err, "data channel send failed");
                }
                Ok(())
            }
            PeerOp::Close => break,
        };
        if let Err(err) = result {
            warn!(target = "beach_pair::peer", epoch, error = %err, "negotiation step failed");
            sink.negotiation_failed(err);
        }
    }

    engine.close().await;
    trace!(target = "beach_pair::peer", epoch, "peer worker exited");
}

fn set_state(state: &Mutex<NegotiationState>, next: NegotiationState) {
    let mut current = state.lock();
    if *current != NegotiationState::Closed {
        *current = next;
    }
}

async fn start_offer(
    engine: &dyn NegotiationEngine,
    label: &str,
) -> Result<SessionDescription, NegotiationError> {
    engine.create_data_channel(label).await?;
    let offer = engine.create_offer().await?;
    engine.set_local_description(&offer).await?;
    Ok(offer)
}

async fn apply_remote(
    engine: &dyn NegotiationEngine,
    role: PairMode,
    desc: SessionDescription,
    sink: &EngineSink,
    state: &Mutex<NegotiationState>,
) -> Result<(), NegotiationError> {
    match (role, desc.kind) {
        (PairMode::Master, SdpKind::Answer) => {
            engine.set_remote_description(&desc).await?;
            set_state(state, NegotiationState::DescriptionsExchanged);
            Ok(())
        }
        (PairMode::Slave, SdpKind::Offer) => {
            engine.set_remote_description(&desc).await?;
            let answer = engine.create_answer().await?;
            engine.set_local_description(&answer).await?;
            set_state(state, NegotiationState::DescriptionsExchanged);
            sink.local_description_ready(answer);
            Ok(())
        }
        (role, kind) => Err(NegotiationError::UnexpectedDescription { role, kind }),
    }
}
