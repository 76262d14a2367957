use std::borrow::Cow;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use beach_pair::relay::{
    DisconnectReason, RelayClient, RelayError, RelayEvent, RelayNotice, RelaySink, WsRelay,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use url::Url;

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Websocket server that hands every accepted socket to the test.
struct SocketFixture {
    url: Url,
    accepted: mpsc::UnboundedReceiver<WebSocket>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl SocketFixture {
    async fn start() -> Self {
        init_tracing();
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let router = Router::new()
            .route("/ws", get(upgrade))
            .with_state(accepted_tx);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Self {
            url: Url::parse(&format!("ws://{addr}/ws")).expect("fixture url"),
            accepted,
            shutdown: Some(shutdown_tx),
        }
    }

    async fn accept(&mut self) -> WebSocket {
        timeout(Duration::from_secs(5), self.accepted.recv())
            .await
            .expect("client never connected")
            .expect("fixture stopped")
    }
}

impl Drop for SocketFixture {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
    }
}

async fn upgrade(
    State(accepted): State<mpsc::UnboundedSender<WebSocket>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let _ = accepted.send(socket);
    })
}

async fn next_notice(notices: &mut mpsc::UnboundedReceiver<RelayNotice>) -> RelayEvent {
    let notice = timeout(Duration::from_secs(5), notices.recv())
        .await
        .expect("timed out waiting for relay notice")
        .expect("relay notice stream closed");
    notice.event
}

async fn server_text(socket: &mut WebSocket) -> String {
    loop {
        let message = timeout(Duration::from_secs(5), socket.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client went away")
            .expect("socket error");
        match message {
            WsMessage::Text(text) => return text,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected client frame {other:?}"),
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn frames_flow_both_ways() {
    let mut fixture = SocketFixture::start().await;
    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(7);
    relay.connect(&fixture.url, sink);
    let mut socket = fixture.accept().await;

    assert_eq!(next_notice(&mut notices).await, RelayEvent::Connected);
    assert!(relay.is_connected());

    relay
        .send(r#"{"type":"unpair"}"#.to_string())
        .expect("send while connected");
    assert_eq!(server_text(&mut socket).await, r#"{"type":"unpair"}"#);

    socket
        .send(WsMessage::Text(r#"{"type":"full"}"#.into()))
        .await
        .expect("server send");
    assert_eq!(
        next_notice(&mut notices).await,
        RelayEvent::Message(br#"{"type":"full"}"#.to_vec())
    );

    socket
        .send(WsMessage::Binary(br#"{"type":"unpair"}"#.to_vec()))
        .await
        .expect("server send binary");
    assert_eq!(
        next_notice(&mut notices).await,
        RelayEvent::Message(br#"{"type":"unpair"}"#.to_vec())
    );
}

#[test_timeout::tokio_timeout_test]
async fn notices_carry_the_link_id() {
    let mut fixture = SocketFixture::start().await;
    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(42);
    relay.connect(&fixture.url, sink);
    let _socket = fixture.accept().await;

    let notice = timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        notice,
        RelayNotice {
            link: 42,
            event: RelayEvent::Connected
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn send_requires_a_connected_link() {
    let relay = WsRelay::new();
    assert!(!relay.is_connected());
    assert_eq!(
        relay.send("{}".to_string()),
        Err(RelayError::NotConnected)
    );
}

#[test_timeout::tokio_timeout_test]
async fn refused_connect_is_reported() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(1);
    relay.connect(&Url::parse(&format!("ws://{addr}/ws")).unwrap(), sink);

    assert!(matches!(
        next_notice(&mut notices).await,
        RelayEvent::ConnectFailed(_)
    ));
    assert!(!relay.is_connected());
}

#[test_timeout::tokio_timeout_test]
async fn clean_close_from_relay_is_a_drop() {
    let mut fixture = SocketFixture::start().await;
    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(1);
    relay.connect(&fixture.url, sink);
    let mut socket = fixture.accept().await;
    assert_eq!(next_notice(&mut notices).await, RelayEvent::Connected);

    socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: 1000,
            reason: Cow::from("bye"),
        })))
        .await
        .expect("server close");

    assert_eq!(
        next_notice(&mut notices).await,
        RelayEvent::Disconnected(DisconnectReason::Error)
    );
    assert!(!relay.is_connected());
    assert_eq!(
        relay.send("{}".to_string()),
        Err(RelayError::NotConnected)
    );
}

#[test_timeout::tokio_timeout_test]
async fn wss_dial_reaches_tls_handshake() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed_tx, dialed_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            drop(stream);
            let _ = dialed_tx.send(());
        }
    });

    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(1);
    relay.connect(&Url::parse(&format!("wss://{addr}/ws")).unwrap(), sink);

    timeout(Duration::from_secs(5), dialed_rx)
        .await
        .expect("wss relay was never dialed")
        .expect("accept task gone");
    match next_notice(&mut notices).await {
        RelayEvent::ConnectFailed(reason) => {
            assert!(
                !reason.contains("TLS support not compiled in"),
                "wss rejected before dialing: {reason}"
            );
        }
        other => panic!("expected a failed handshake, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn abnormal_close_is_reported_as_error() {
    let mut fixture = SocketFixture::start().await;
    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(1);
    relay.connect(&fixture.url, sink);
    let mut socket = fixture.accept().await;
    assert_eq!(next_notice(&mut notices).await, RelayEvent::Connected);

    socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: 1011,
            reason: Cow::from("internal error"),
        })))
        .await
        .expect("server close");

    assert_eq!(
        next_notice(&mut notices).await,
        RelayEvent::Disconnected(DisconnectReason::Error)
    );
}

#[test_timeout::tokio_timeout_test]
async fn vanished_server_is_reported_as_error() {
    let mut fixture = SocketFixture::start().await;
    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(1);
    relay.connect(&fixture.url, sink);
    let socket = fixture.accept().await;
    assert_eq!(next_notice(&mut notices).await, RelayEvent::Connected);

    drop(socket);
    assert_eq!(
        next_notice(&mut notices).await,
        RelayEvent::Disconnected(DisconnectReason::Error)
    );
}

#[test_timeout::tokio_timeout_test]
async fn disconnect_closes_socket_and_goes_quiet() {
    let mut fixture = SocketFixture::start().await;
    let mut relay = WsRelay::new();
    let (sink, mut notices) = RelaySink::channel(1);
    relay.connect(&fixture.url, sink);
    let mut socket = fixture.accept().await;
    assert_eq!(next_notice(&mut notices).await, RelayEvent::Connected);

    relay.disconnect();
    assert!(!relay.is_connected());

    let closing = timeout(Duration::from_secs(5), socket.recv())
        .await
        .expect("server never saw the close");
    assert!(matches!(closing, None | Some(Ok(WsMessage::Close(_))) | Some(Err(_))));

    let after = timeout(Duration::from_millis(300), notices.recv()).await;
    assert!(
        !matches!(after, Ok(Some(_))),
        "released link still reported {after:?}"
    );
}

#[test_timeout::tokio_timeout_test]
async fn reconnect_replaces_previous_link() {
    let mut fixture = SocketFixture::start().await;
    let mut relay = WsRelay::new();
    let (first_sink, mut first) = RelaySink::channel(1);
    relay.connect(&fixture.url, first_sink);
    let _first_socket = fixture.accept().await;
    assert_eq!(next_notice(&mut first).await, RelayEvent::Connected);

    let (second_sink, mut second) = RelaySink::channel(2);
    relay.connect(&fixture.url, second_sink);
    let mut second_socket = fixture.accept().await;
    assert_eq!(next_notice(&mut second).await, RelayEvent::Connected);

    relay.send(r#"{"type":"full"}"#.to_string()).unwrap();
    assert_eq!(server_text(&mut second_socket).await, r#"{"type":"full"}"#);

    let stale = timeout(Duration::from_millis(300), first.recv()).await;
    assert!(!matches!(stale, Ok(Some(_))));
}
