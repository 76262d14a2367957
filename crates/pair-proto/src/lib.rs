//! Wire protocol spoken between beach-pair clients and the pairing relay.
//! Frames are single-line JSON objects discriminated by a `type` field; the
//! codec decodes the discriminant first so malformed or unknown frames can be
//! reported and skipped without touching session state.

mod codec;
mod message;
mod room;

pub use codec::{
    decode, decode_envelope, decode_payload, encode, CandidateFrame, DecodeError,
    DescriptionFrame, EncodeError,
};
pub use message::{
    CandidateData, MessageKind, PairBroadcast, PairMode, PairRequest, SdpKind,
    SessionDescription, SignalingMessage,
};
pub use room::{MAX_ROOM_ID_LEN, MIN_ROOM_ID_LEN, RoomId, RoomIdError};
