use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use fwdpanel_hub::{AppState, ROUTES, build_router, serve};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestClient {
    write: WsWrite,
    read: WsRead,
}

#[tokio::test]
async fn ping_is_answered_with_pong_echoing_timestamp() {
    let (address, shutdown_tx) = start_hub().await;
    let mut client = connect_client(&address).await;

    send_json(&mut client, json!({"type": "ping", "timestamp": 1_735_000_000_123_u64})).await;

    let reply = recv_json(&mut client, Duration::from_secs(2))
        .await
        .expect("pong reply");
    assert_eq!(reply, json!({"type": "pong", "timestamp": 1_735_000_000_123_u64}));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn client_message_is_forwarded_to_other_clients_only() {
    let (address, shutdown_tx) = start_hub().await;
    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;
    wait_for_clients(&address, 2).await;

    let event = json!({"type": "notification", "title": "bot online", "bot_id": 7});
    send_json(&mut client_a, event.clone()).await;

    let received_b = recv_json(&mut client_b, Duration::from_secs(2)).await;
    assert_eq!(received_b, Some(event));

    let received_a = recv_json(&mut client_a, Duration::from_millis(300)).await;
    assert!(
        received_a.is_none(),
        "sender unexpectedly received its own message"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn published_event_reaches_every_client() {
    let (address, shutdown_tx) = start_hub().await;
    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;
    wait_for_clients(&address, 2).await;

    let event = json!({"type": "new_log", "level": "info", "message": "forwarded 3 messages"});
    let (status, body) = http_request(&address, "POST", "/publish", Some(&event)).await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], 2);

    for client in [&mut client_a, &mut client_b] {
        let received = recv_json(client, Duration::from_secs(2)).await;
        assert_eq!(received, Some(event.clone()));
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn publish_without_type_is_rejected() {
    let (address, shutdown_tx) = start_hub().await;

    let (status, body) =
        http_request(&address, "POST", "/publish", Some(&json!({"level": "info"}))).await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("type")));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_text_is_dropped_and_socket_stays_usable() {
    let (address, shutdown_tx) = start_hub().await;
    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;
    wait_for_clients(&address, 2).await;

    client_a
        .write
        .send(Message::Text("{definitely not json".into()))
        .await
        .expect("send malformed text");

    let received_b = recv_json(&mut client_b, Duration::from_millis(300)).await;
    assert!(received_b.is_none(), "malformed text was forwarded");

    send_json(&mut client_a, json!({"type": "ping", "timestamp": 5})).await;
    let reply = recv_json(&mut client_a, Duration::from_secs(2)).await;
    assert_eq!(reply, Some(json!({"type": "pong", "timestamp": 5})));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn kick_closes_sockets_and_health_reports_clients() {
    let (address, shutdown_tx) = start_hub().await;
    let mut client = connect_client(&address).await;
    wait_for_clients(&address, 1).await;

    let (status, body) = http_request(&address, "POST", "/kick", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["kicked"], 1);

    let closed = timeout(Duration::from_secs(2), client.read.next())
        .await
        .expect("hub should close the socket quickly");
    assert!(
        closed.is_none()
            || matches!(closed, Some(Ok(Message::Close(_))))
            || matches!(closed, Some(Err(_))),
        "expected websocket termination after kick"
    );

    let (_, health) = http_request(&address, "GET", "/health", None).await;
    assert_eq!(health["ok"], true);
    assert_eq!(health["clients"], 0);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn every_listed_route_is_served() {
    let (address, shutdown_tx) = start_hub().await;

    for route in ROUTES {
        let (method, path) = route.split_once(' ').expect("METHOD path");
        let body = (path == "/publish").then(|| json!({"type": "status"}));
        // `/ws` without upgrade headers is refused by the extractor, not the router.
        let (status, _) = http_request(&address, method, path, body.as_ref()).await;
        assert_ne!(status, 404, "{route} is not routed");
        assert_ne!(status, 405, "{route} has the wrong method");
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn serve_returns_once_shutdown_resolves() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral hub socket");
    let address = listener.local_addr().expect("hub local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(listener, AppState::new(), async {
        let _ = shutdown_rx.await;
    }));

    let (status, health) = http_request(&address, "GET", "/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(health["clients"], 0);

    let _ = shutdown_tx.send(());
    let result = timeout(Duration::from_secs(2), server)
        .await
        .expect("serve stops promptly")
        .expect("serve task joins");
    assert!(result.is_ok());
}

async fn start_hub() -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral hub socket");
    let address = listener.local_addr().expect("hub local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, build_router(AppState::new())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (address, shutdown_tx)
}

async fn connect_client(address: &SocketAddr) -> TestClient {
    let (ws_stream, _) = connect_async(format!("ws://{address}/ws"))
        .await
        .expect("connect websocket");
    let (write, read) = ws_stream.split();
    TestClient { write, read }
}

async fn wait_for_clients(address: &SocketAddr, expected: u64) {
    for _ in 0..50 {
        let (_, health) = http_request(address, "GET", "/health", None).await;
        if health["clients"].as_u64() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub never reported {expected} clients");
}

async fn send_json(client: &mut TestClient, value: Value) {
    client
        .write
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send json text");
}

async fn recv_json(client: &mut TestClient, wait: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        let next = timeout(remaining, client.read.next()).await.ok()??;
        match next.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn http_request(
    address: &SocketAddr,
    method: &str,
    path: &str,
    body: Option<&Value>,
) -> (u16, Value) {
    let body = body.map(Value::to_string).unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {address}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );

    let mut stream = TcpStream::connect(address).await.expect("connect http");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write http request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read http response");

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("http status code");
    let payload = response
        .split_once("\r\n\r\n")
        .and_then(|(_, body)| serde_json::from_str(body).ok())
        .unwrap_or(Value::Null);
    (status, payload)
}
