use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::{
    CandidateData, MessageKind, PairBroadcast, PairRequest, SdpKind, SessionDescription,
    SignalingMessage,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a json object: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no `type` field")]
    MissingKind,
    #[error("unknown message type {0}")]
    UnknownKind(String),
    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{envelope}` frame carries an `{payload}` description")]
    KindMismatch {
        envelope: MessageKind,
        payload: SdpKind,
    },
}

impl DecodeError {
    /// Unknown kinds are expected from newer relays and are not worth a warning.
    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, DecodeError::UnknownKind(_))
    }
}

#[derive(Debug, Error)]
#[error("failed to encode `{kind}` message: {source}")]
pub struct EncodeError {
    pub kind: MessageKind,
    #[source]
    pub source: serde_json::Error,
}

/// Payload shape of `offer` and `answer` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionFrame {
    pub data: SessionDescription,
}

/// Payload shape of `candidate` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFrame {
    pub data: CandidateData,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PairFrame {
    Broadcast(PairBroadcast),
    Request(PairRequest),
}

#[derive(Serialize)]
struct Envelope<B: Serialize> {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(flatten)]
    body: B,
}

#[derive(Serialize)]
struct DataBody<'a, T: Serialize> {
    data: &'a T,
}

#[derive(Serialize)]
struct Empty {}

/// Serializes a message into one text frame.
pub fn encode(message: &SignalingMessage) -> Result<String, EncodeError> {
    let kind = message.kind();
    let result = match message {
        SignalingMessage::Full | SignalingMessage::Unpair => {
            serde_json::to_string(&Envelope { kind, body: Empty {} })
        }
        SignalingMessage::PairRequest(request) => {
            serde_json::to_string(&Envelope { kind, body: request })
        }
        SignalingMessage::PairBroadcast(broadcast) => serde_json::to_string(&Envelope {
            kind,
            body: broadcast,
        }),
        SignalingMessage::Description(desc) => serde_json::to_string(&Envelope {
            kind,
            body: DataBody { data: desc },
        }),
        SignalingMessage::Candidate(candidate) => serde_json::to_string(&Envelope {
            kind,
            body: DataBody { data: candidate },
        }),
    };
    result.map_err(|source| EncodeError { kind, source })
}

/// Reads only the `type` discriminant of a frame.
pub fn decode_envelope(bytes: &[u8]) -> Result<MessageKind, DecodeError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    match raw.kind {
        None | Some(Value::Null) => Err(DecodeError::MissingKind),
        Some(Value::String(text)) => {
            MessageKind::parse(&text).ok_or(DecodeError::UnknownKind(text))
        }
        Some(other) => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

/// Strictly decodes one typed frame shape announced as `kind`.
pub fn decode_payload<T: DeserializeOwned>(
    kind: MessageKind,
    bytes: &[u8],
) -> Result<T, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError::Payload { kind, source })
}

/// Two-phase decode: discriminant first, then the payload the discriminant implies.
pub fn decode(bytes: &[u8]) -> Result<SignalingMessage, DecodeError> {
    let kind = decode_envelope(bytes)?;
    let message = match kind {
        MessageKind::Full => SignalingMessage::Full,
        MessageKind::Unpair => SignalingMessage::Unpair,
        MessageKind::Pair => match decode_payload::<PairFrame>(kind, bytes)? {
            PairFrame::Broadcast(broadcast) => SignalingMessage::PairBroadcast(broadcast),
            PairFrame::Request(request) => SignalingMessage::PairRequest(request),
        },
        MessageKind::Offer | MessageKind::Answer => {
            let frame: DescriptionFrame = decode_payload(kind, bytes)?;
            if frame.data.kind.message_kind() != kind {
                return Err(DecodeError::KindMismatch {
                    envelope: kind,
                    payload: frame.data.kind,
                });
            }
            SignalingMessage::Description(frame.data)
        }
        MessageKind::Candidate => {
            let frame: CandidateFrame = decode_payload(kind, bytes)?;
            SignalingMessage::Candidate(frame.data)
        }
    };
    Ok(message)
}
