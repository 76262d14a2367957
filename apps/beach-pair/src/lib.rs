//! Pairs two clients through a signaling relay and negotiates a direct
//! WebRTC data channel between them.
//!
//! [`session::spawn`] starts the orchestrator over any [`relay::RelayClient`]
//! and [`peer::EngineFactory`]; [`relay::WsRelay`] and
//! [`peer::RtcEngineFactory`] are the production implementations.

pub mod config;
pub mod peer;
pub mod relay;
pub mod session;
pub mod telemetry;

pub use config::PairingConfig;
pub use session::{PairingError, PairingHandle, SessionEvent, SessionSnapshot};
