#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beach_pair::PairingConfig;
use beach_pair::peer::{EngineFactory, EngineSink, NegotiationEngine, NegotiationError};
use beach_pair::relay::{DisconnectReason, RelayClient, RelayError, RelaySink};
use beach_pair::session::SessionEvent;
use pair_proto::{CandidateData, SessionDescription};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use url::Url;

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn test_config() -> PairingConfig {
    PairingConfig {
        relay_url: "ws://relay.test/api/connect".into(),
        client_id: "test-client".into(),
        channel_label: "chat".into(),
        reconnect_delay: Duration::from_secs(3),
        ice_servers: Vec::new(),
    }
}

/// Ordered record shared by the fake relay and fake engines, so tests can
/// assert on interleaving across both.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

#[derive(Default)]
struct RelayState {
    sink: Option<RelaySink>,
    connected: bool,
    connects: Vec<String>,
    frames: Vec<Value>,
    disconnects: usize,
}

/// Test-side controls for a [`FakeRelay`].
#[derive(Clone)]
pub struct RelayControls {
    state: Arc<Mutex<RelayState>>,
    journal: Journal,
}

pub struct FakeRelay {
    remote: RelayControls,
}

pub fn fake_relay(journal: &Journal) -> (Box<dyn RelayClient>, RelayControls) {
    let remote = RelayControls {
        state: Arc::new(Mutex::new(RelayState::default())),
        journal: journal.clone(),
    };
    let relay = FakeRelay {
        remote: remote.clone(),
    };
    (Box::new(relay), remote)
}

impl RelayClient for FakeRelay {
    fn connect(&mut self, endpoint: &Url, sink: RelaySink) {
        let mut state = self.remote.state.lock();
        state.connects.push(endpoint.to_string());
        state.sink = Some(sink);
        state.connected = false;
        self.remote.journal.push("relay.connect");
    }

    fn send(&self, frame: String) -> Result<(), RelayError> {
        let mut state = self.remote.state.lock();
        if !state.connected {
            return Err(RelayError::NotConnected);
        }
        let value: Value = serde_json::from_str(&frame).expect("frames are json");
        let kind = value["type"].as_str().unwrap_or("?").to_string();
        self.remote.journal.push(format!("relay.send:{kind}"));
        state.frames.push(value);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.remote.state.lock();
        state.connected = false;
        state.sink = None;
        state.disconnects += 1;
    }

    fn is_connected(&self) -> bool {
        self.remote.state.lock().connected
    }
}

impl RelayControls {
    fn sink(&self) -> RelaySink {
        self.state
            .lock()
            .sink
            .clone()
            .expect("relay has no attached link")
    }

    pub fn current_sink(&self) -> Option<RelaySink> {
        self.state.lock().sink.clone()
    }

    /// Completes the pending connect.
    pub fn accept(&self) {
        let sink = {
            let mut state = self.state.lock();
            state.connected = true;
            state.sink.clone().expect("connect was not called")
        };
        sink.connected();
    }

    pub fn refuse(&self) {
        self.sink().connect_failed("connection refused");
    }

    pub fn deliver(&self, frame: Value) {
        self.sink().message(frame.to_string().into_bytes());
    }

    pub fn deliver_raw(&self, bytes: &[u8]) {
        self.sink().message(bytes.to_vec());
    }

    pub fn drop_link(&self) {
        let sink = {
            let mut state = self.state.lock();
            state.connected = false;
            state.sink.clone().expect("relay has no attached link")
        };
        sink.disconnected(DisconnectReason::Error);
    }

    pub fn close_link(&self) {
        let sink = {
            let mut state = self.state.lock();
            state.connected = false;
            state.sink.clone().expect("relay has no attached link")
        };
        sink.disconnected(DisconnectReason::Normal);
    }

    pub fn frames(&self) -> Vec<Value> {
        self.state.lock().frames.clone()
    }

    pub fn frames_of(&self, kind: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects.len()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }
}

pub struct FakeEngine {
    journal: Journal,
    epoch: u64,
    fail_remote: bool,
    offer_gate: Option<Arc<Notify>>,
}

#[async_trait]
impl NegotiationEngine for FakeEngine {
    async fn create_data_channel(&self, label: &str) -> Result<(), NegotiationError> {
        self.journal.push(format!("engine.data_channel:{label}"));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if let Some(gate) = &self.offer_gate {
            gate.notified().await;
        }
        self.journal.push("engine.create_offer");
        Ok(SessionDescription::offer(format!("offer-{}", self.epoch)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.journal.push("engine.create_answer");
        Ok(SessionDescription::answer(format!("answer-{}", self.epoch)))
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.journal.push(format!("engine.set_local:{}", desc.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.journal.push(format!("engine.set_remote:{}", desc.kind));
        if self.fail_remote {
            return Err(NegotiationError::engine(
                "set_remote_description",
                "malformed sdp",
            ));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &CandidateData) -> Result<(), NegotiationError> {
        self.journal
            .push(format!("engine.add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), NegotiationError> {
        self.journal.push(format!("engine.send_text:{text}"));
        Ok(())
    }

    async fn close(&self) {
        self.journal.push(format!("engine.close:{}", self.epoch));
    }
}

/// Factory handing out [`FakeEngine`]s and keeping each engine's sink so tests
/// can play the engine's asynchronous callbacks.
pub struct FakeEngines {
    journal: Journal,
    sinks: Mutex<Vec<EngineSink>>,
    fail_remote: bool,
    offer_gate: Option<Arc<Notify>>,
}

impl FakeEngines {
    pub fn new(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            sinks: Mutex::new(Vec::new()),
            fail_remote: false,
            offer_gate: None,
        })
    }

    pub fn rejecting_remote(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            sinks: Mutex::new(Vec::new()),
            fail_remote: true,
            offer_gate: None,
        })
    }

    /// Engines whose offers are only produced once the returned gate is
    /// notified, one offer per notification.
    pub fn gated_offer(journal: &Journal) -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let engines = Arc::new(Self {
            journal: journal.clone(),
            sinks: Mutex::new(Vec::new()),
            fail_remote: false,
            offer_gate: Some(Arc::clone(&gate)),
        });
        (engines, gate)
    }

    pub fn created(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn latest_sink(&self) -> EngineSink {
        self.sinks
            .lock()
            .last()
            .cloned()
            .expect("no engine created yet")
    }
}

#[async_trait]
impl EngineFactory for FakeEngines {
    async fn create(
        &self,
        sink: EngineSink,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let epoch = sink.epoch();
        self.journal.push(format!("engine.create:{epoch}"));
        self.sinks.lock().push(sink);
        Ok(Arc::new(FakeEngine {
            journal: self.journal.clone(),
            epoch,
            fail_remote: self.fail_remote,
            offer_gate: self.offer_gate.clone(),
        }))
    }
}

pub async fn next_event(events: &mut UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session event stream closed")
}

/// Skips events until one matches.
pub async fn wait_for(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

pub fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

pub fn pair_frame(partner: &str, mode: &str, reconnect: Option<bool>) -> Value {
    json!({"type": "pair", "partnerId": partner, "mode": mode, "reconnect": reconnect})
}

pub fn offer_frame(sdp: &str) -> Value {
    json!({"type": "offer", "data": {"type": "offer", "sdp": sdp}})
}

pub fn answer_frame(sdp: &str) -> Value {
    json!({"type": "answer", "data": {"type": "answer", "sdp": sdp}})
}

pub fn candidate_frame(candidate: &str) -> Value {
    json!({"type": "candidate", "data": {"candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0}})
}
