use std::fmt;
use std::time::Duration;

use pair_proto::{PairMode, PairRequest, RoomIdError, SdpKind};
use thiserror::Error;

use crate::peer::{Epoch, NegotiationError, NegotiationState, PeerConnectionState};
use crate::relay::LinkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    None,
    Master,
    Slave,
}

impl From<PairMode> for Role {
    fn from(mode: PairMode) -> Self {
        match mode {
            PairMode::Master => Role::Master,
            PairMode::Slave => Role::Slave,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    AwaitingPartner,
    Paired(PairMode),
    Reconnecting,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Disconnected => f.write_str("disconnected"),
            Phase::Connecting => f.write_str("connecting"),
            Phase::AwaitingPartner => f.write_str("awaiting partner"),
            Phase::Paired(mode) => write!(f, "paired as {mode}"),
            Phase::Reconnecting => f.write_str("reconnecting"),
            Phase::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    Requested,
    RoomFull,
}

/// Point-in-time view of the orchestrator's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub role: Role,
    pub partner_id: Option<String>,
    pub pending: Option<PairRequest>,
    pub negotiation: NegotiationState,
    pub channel_open: bool,
    pub link: Option<LinkId>,
    pub epoch: Option<Epoch>,
}

/// Lifecycle notices published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connecting { url: String },
    RelayConnected,
    PairRequestSent { room_id: String, reconnect: bool },
    RoomFull,
    Paired {
        partner_id: String,
        mode: PairMode,
        resumed: bool,
    },
    PartnerUnpaired,
    Reconnecting { delay: Duration },
    DescriptionSent(SdpKind),
    CandidateAdded,
    CandidateSent,
    DataChannelOpen { label: String },
    MessageReceived(String),
    MessageSent(String),
    NegotiationFailed(NegotiationError),
    PeerStateChanged(PeerConnectionState),
    Disconnected { cause: DisconnectCause },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connecting { url } => write!(f, "connecting to {url}"),
            SessionEvent::RelayConnected => f.write_str("relay connected"),
            SessionEvent::PairRequestSent { room_id, reconnect } => {
                if *reconnect {
                    write!(f, "rejoining room {room_id}")
                } else {
                    write!(f, "joining room {room_id}")
                }
            }
            SessionEvent::RoomFull => f.write_str("room is full"),
            SessionEvent::Paired {
                partner_id,
                mode,
                resumed,
            } => {
                if *resumed {
                    write!(f, "resumed pairing with {partner_id} as {mode}")
                } else {
                    write!(f, "paired with {partner_id} as {mode}")
                }
            }
            SessionEvent::PartnerUnpaired => f.write_str("remote partner manually disconnected"),
            SessionEvent::Reconnecting { delay } => {
                write!(f, "relay lost, reconnecting in {}ms", delay.as_millis())
            }
            SessionEvent::DescriptionSent(kind) => write!(f, "sent {kind}"),
            SessionEvent::CandidateAdded => f.write_str("added remote candidate"),
            SessionEvent::CandidateSent => f.write_str("sent local candidate"),
            SessionEvent::DataChannelOpen { label } => write!(f, "data channel {label} open"),
            SessionEvent::MessageReceived(text) => write!(f, "partner: {text}"),
            SessionEvent::MessageSent(text) => write!(f, "me: {text}"),
            SessionEvent::NegotiationFailed(err) => write!(f, "negotiation failed: {err}"),
            SessionEvent::PeerStateChanged(state) => write!(f, "peer connection {state}"),
            SessionEvent::Disconnected { cause } => match cause {
                DisconnectCause::Requested => f.write_str("disconnected"),
                DisconnectCause::RoomFull => f.write_str("disconnected: room full"),
            },
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error(transparent)]
    InvalidRoomId(#[from] RoomIdError),
    #[error("pairing already active ({0})")]
    AlreadyActive(Phase),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("pairing session has shut down")]
    Closed,
}
