use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tracing::{debug, trace, warn};
use url::Url;

use super::{DisconnectReason, LinkId, RelayClient, RelayError, RelaySink};

/// Relay client over a tokio-tungstenite websocket. Each `connect` spawns one
/// link task that dials, then reads; writes go through a separate writer task
/// fed by an unbounded channel.
#[derive(Default)]
pub struct WsRelay {
    link: Option<Link>,
}

struct Link {
    id: LinkId,
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WsRelay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelayClient for WsRelay {
    fn connect(&mut self, endpoint: &Url, sink: RelaySink) {
        self.disconnect();
        let id = sink.link();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        debug!(
            target = "beach_pair::relay",
            link = id,
            url = %endpoint,
            "dialing relay"
        );
        let task = tokio::spawn(run_link(
            endpoint.clone(),
            sink,
            outbound_rx,
            Arc::clone(&connected),
        ));
        self.link = Some(Link {
            id,
            outbound,
            connected,
            task,
        });
    }

    fn send(&self, frame: String) -> Result<(), RelayError> {
        let link = self
            .link
            .as_ref()
            .filter(|link| link.connected.load(Ordering::SeqCst))
            .ok_or(RelayError::NotConnected)?;
        trace!(
            target = "beach_pair::relay",
            link = link.id,
            event = "ws_out",
            len = frame.len()
        );
        link.outbound
            .send(Message::Text(frame))
            .map_err(|_| RelayError::NotConnected)
    }

    fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        if link.connected.swap(false, Ordering::SeqCst) {
            // the writer owns the socket half and exits after flushing this
            let _ = link.outbound.send(Message::Close(None));
        }
        link.task.abort();
        debug!(target = "beach_pair::relay", link = link.id, "relay link released");
    }

    fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.connected.load(Ordering::SeqCst))
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_link(
    endpoint: Url,
    sink: RelaySink,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    connected: Arc<AtomicBool>,
) {
    let link = sink.link();
    let stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            warn!(
                target = "beach_pair::relay",
                link,
                url = %endpoint,
                error = %err,
                "relay connect failed"
            );
            sink.connect_failed(err.to_string());
            return;
        }
    };
    let (mut ws_write, mut ws_read) = stream.split();

    let writer_connected = Arc::clone(&connected);
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_write.send(message).await.is_err() {
                writer_connected.store(false, Ordering::SeqCst);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    connected.store(true, Ordering::SeqCst);
    debug!(target = "beach_pair::relay", link, "relay websocket connected");
    sink.connected();

    loop {
        match ws_read.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(
                    target = "beach_pair::relay",
                    link,
                    event = "ws_in",
                    kind = "text",
                    len = text.len()
                );
                sink.message(text.into_bytes());
            }
            Some(Ok(Message::Binary(data))) => {
                trace!(
                    target = "beach_pair::relay",
                    link,
                    event = "ws_in",
                    kind = "binary",
                    len = data.len()
                );
                sink.message(data);
            }
            Some(Ok(Message::Close(frame))) => {
                // a clean close from the relay is still a drop the user did not ask for
                debug!(target = "beach_pair::relay", link, frame = ?frame, "relay sent close");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!(target = "beach_pair::relay", link, "relay websocket closed: {err}");
                    }
                    _ => {
                        warn!(target = "beach_pair::relay", link, "relay websocket error: {err}");
                    }
                }
                break;
            }
            None => break,
        }
    }

    connected.store(false, Ordering::SeqCst);
    sink.disconnected(DisconnectReason::Error);
}
