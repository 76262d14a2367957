use std::fmt;

use serde::{Deserialize, Serialize};

use crate::room::RoomId;

/// Discriminant carried in the `type` field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Full,
    Pair,
    Candidate,
    Offer,
    Answer,
    Unpair,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Full => "full",
            MessageKind::Pair => "pair",
            MessageKind::Candidate => "candidate",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Unpair => "unpair",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(MessageKind::Full),
            "pair" => Some(MessageKind::Pair),
            "candidate" => Some(MessageKind::Candidate),
            "offer" => Some(MessageKind::Offer),
            "answer" => Some(MessageKind::Answer),
            "unpair" => Some(MessageKind::Unpair),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role the relay assigns in a `pair` broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairMode {
    Master,
    Slave,
}

impl fmt::Display for PairMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairMode::Master => f.write_str("master"),
            PairMode::Slave => f.write_str("slave"),
        }
    }
}

/// Outbound request to join a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub client_id: String,
    pub room_id: String,
    pub reconnect: bool,
}

impl PairRequest {
    pub fn new(client_id: impl Into<String>, room: &RoomId) -> Self {
        Self {
            client_id: client_id.into(),
            room_id: room.as_str().to_string(),
            reconnect: false,
        }
    }
}

/// Inbound partner assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairBroadcast {
    pub partner_id: String,
    pub mode: PairMode,
    #[serde(default)]
    pub reconnect: Option<bool>,
}

impl PairBroadcast {
    pub fn is_reconnect(&self) -> bool {
        self.reconnect.unwrap_or(false)
    }
}

/// SDP type as it appears inside an `offer`/`answer` frame. Provisional
/// answers are not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn message_kind(self) -> MessageKind {
        match self {
            SdpKind::Offer => MessageKind::Offer,
            SdpKind::Answer => MessageKind::Answer,
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_kind().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateData {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: i32,
}

/// Every frame the relay protocol knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Full,
    PairRequest(PairRequest),
    PairBroadcast(PairBroadcast),
    Description(SessionDescription),
    Candidate(CandidateData),
    Unpair,
}

impl SignalingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::Full => MessageKind::Full,
            SignalingMessage::PairRequest(_) | SignalingMessage::PairBroadcast(_) => {
                MessageKind::Pair
            }
            SignalingMessage::Description(desc) => desc.kind.message_kind(),
            SignalingMessage::Candidate(_) => MessageKind::Candidate,
            SignalingMessage::Unpair => MessageKind::Unpair,
        }
    }
}
