//! Relay transport seam. A relay client owns at most one live link to the
//! pairing relay; every event it reports is tagged with the link id it was
//! handed in [`RelayClient::connect`], so a replaced link cannot leak events
//! into the session that replaced it.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

mod ws;

pub use ws::WsRelay;

pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed on the user's request. Clients that detach on `disconnect`
    /// never report it.
    Normal,
    /// Any loss the user did not ask for, clean relay closes included.
    Error,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Normal => f.write_str("normal"),
            DisconnectReason::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected,
    ConnectFailed(String),
    Message(Vec<u8>),
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNotice {
    pub link: LinkId,
    pub event: RelayEvent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay link is not connected")]
    NotConnected,
}

/// Where a relay client reports what happens on one link.
#[derive(Clone)]
pub struct RelaySink {
    link: LinkId,
    deliver: Arc<dyn Fn(RelayNotice) + Send + Sync>,
}

impl RelaySink {
    pub fn new(link: LinkId, deliver: impl Fn(RelayNotice) + Send + Sync + 'static) -> Self {
        Self {
            link,
            deliver: Arc::new(deliver),
        }
    }

    /// Sink backed by a plain channel, for driving a relay client directly.
    pub fn channel(link: LinkId) -> (Self, mpsc::UnboundedReceiver<RelayNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(link, move |notice| {
            let _ = tx.send(notice);
        });
        (sink, rx)
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn connected(&self) {
        self.emit(RelayEvent::Connected);
    }

    pub fn connect_failed(&self, reason: impl Into<String>) {
        self.emit(RelayEvent::ConnectFailed(reason.into()));
    }

    pub fn message(&self, bytes: Vec<u8>) {
        self.emit(RelayEvent::Message(bytes));
    }

    pub fn disconnected(&self, reason: DisconnectReason) {
        self.emit(RelayEvent::Disconnected(reason));
    }

    fn emit(&self, event: RelayEvent) {
        (self.deliver)(RelayNotice {
            link: self.link,
            event,
        });
    }
}

impl fmt::Debug for RelaySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySink").field("link", &self.link).finish()
    }
}

/// Client side of the relay socket.
///
/// `connect` must not block: completion is reported through the sink as
/// `Connected` or `ConnectFailed`. After `disconnect` the client reports
/// nothing further for the released link.
pub trait RelayClient: Send {
    fn connect(&mut self, endpoint: &Url, sink: RelaySink);
    fn send(&self, frame: String) -> Result<(), RelayError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
}
