use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use pair_proto::{CandidateData, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{EngineFactory, EngineSink, NegotiationEngine, NegotiationError, PeerConnectionState};
use crate::config::PairingConfig;

fn to_setup_error(err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds one [`RtcEngine`] per pairing epoch.
#[derive(Debug, Clone, Default)]
pub struct RtcEngineFactory {
    ice_servers: Vec<String>,
}

impl RtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &PairingConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        sink: EngineSink,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let api = build_api()?;
        let pc = api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(to_setup_error)?;
        let engine = RtcEngine {
            pc: Arc::new(pc),
            channel: Arc::new(Mutex::new(None)),
            early_candidates: Mutex::new(Vec::new()),
            remote_applied: AtomicBool::new(false),
            sink,
        };
        engine.install_callbacks();
        debug!(
            target = "beach_pair::peer::rtc",
            epoch = engine.sink.epoch(),
            ice_servers = self.ice_servers.len(),
            "peer connection created"
        );
        Ok(Arc::new(engine))
    }
}

/// Negotiation engine backed by a `webrtc` peer connection. The master's data
/// channel is created locally; the slave adopts the one announced by the
/// remote side.
///
/// The peer connection refuses candidates before a remote description is set,
/// so those are kept and applied once `set_remote_description` succeeds.
pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    early_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_applied: AtomicBool,
    sink: EngineSink,
}

impl RtcEngine {
    fn install_callbacks(&self) {
        let sink = self.sink.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target = "beach_pair::peer::rtc", "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.local_candidate(candidate_from_rtc(init)),
                    Err(err) => warn!(
                        target = "beach_pair::peer::rtc",
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    debug!(
                        target = "beach_pair::peer::rtc",
                        state = %state,
                        "peer connection state changed"
                    );
                    sink.connection_state(connection_state_from_rtc(state));
                })
            }));

        let sink = self.sink.clone();
        let holder = Arc::clone(&self.channel);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                let holder = Arc::clone(&holder);
                Box::pin(async move {
                    debug!(
                        target = "beach_pair::peer::rtc",
                        label = dc.label(),
                        "adopting remote data channel"
                    );
                    attach_channel(&holder, &sink, dc);
                })
            }));
    }

    fn current_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }

    async fn apply_early_candidates(&self) {
        let early = std::mem::take(&mut *self.early_candidates.lock());
        if early.is_empty() {
            return;
        }
        debug!(
            target = "beach_pair::peer::rtc",
            epoch = self.sink.epoch(),
            count = early.len(),
            "applying candidates received before the remote description"
        );
        for init in early {
            if let Err(err) = self.pc.add_ice_candidate(init).await {
                warn!(
                    target = "beach_pair::peer::rtc",
                    error = %err,
                    "early remote candidate rejected"
                );
            }
        }
    }
}

fn attach_channel(
    holder: &Mutex<Option<Arc<RTCDataChannel>>>,
    sink: &EngineSink,
    dc: Arc<RTCDataChannel>,
) {
    let open_sink = sink.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        let label = label.clone();
        Box::pin(async move {
            debug!(target = "beach_pair::peer::rtc", label = %label, "data channel open");
            sink.data_channel_open(label);
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => sink.data_channel_message(text),
                Err(_) => trace!(
                    target = "beach_pair::peer::rtc",
                    len = msg.data.len(),
                    "ignoring non-utf8 data channel message"
                ),
            }
        })
    }));

    holder.lock().replace(dc);
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn create_data_channel(&self, label: &str) -> Result<(), NegotiationError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| NegotiationError::engine("create_data_channel", err))?;
        attach_channel(&self.channel, &self.sink, dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::engine("create_offer", err))?;
        description_from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| NegotiationError::engine("create_answer", err))?;
        description_from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = description_to_rtc(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|err| NegotiationError::engine("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = description_to_rtc(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| NegotiationError::engine("set_remote_description", err))?;
        self.remote_applied.store(true, Ordering::SeqCst);
        self.apply_early_candidates().await;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &CandidateData) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: u16::try_from(candidate.sdp_m_line_index).ok(),
            username_fragment: None,
        };
        if !self.remote_applied.load(Ordering::SeqCst) {
            trace!(
                target = "beach_pair::peer::rtc",
                epoch = self.sink.epoch(),
                "keeping candidate until the remote description is set"
            );
            self.early_candidates.lock().push(init);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| NegotiationError::engine("add_ice_candidate", err))
    }

    async fn send_text(&self, text: &str) -> Result<(), NegotiationError> {
        let dc = self.current_channel().ok_or(NegotiationError::NoDataChannel)?;
        dc.send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| NegotiationError::engine("send_text", err))
    }

    async fn close(&self) {
        let channel = self.channel.lock().take();
        if let Some(dc) = channel {
            if let Err(err) = dc.close().await {
                debug!(target = "beach_pair::peer::rtc", error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            debug!(target = "beach_pair::peer::rtc", error = %err, "peer connection close failed");
        }
    }
}

/// Engine description to wire description. Provisional answers and rollbacks
/// have no wire form.
pub fn description_from_rtc(
    desc: &RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other @ (RTCSdpType::Pranswer | RTCSdpType::Rollback | RTCSdpType::Unspecified) => {
            return Err(NegotiationError::UnsupportedType(other.to_string()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

pub fn description_to_rtc(
    desc: &SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    result.map_err(|err| NegotiationError::engine("parse_session_description", err))
}

fn candidate_from_rtc(init: RTCIceCandidateInit) -> CandidateData {
    CandidateData {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index.map(i32::from).unwrap_or(0),
    }
}

fn connection_state_from_rtc(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}
