//! 端到端投递流测试：真实 TCP 监听 + WebSocket 客户端
//! End-to-end delivery flow over a real listener and WebSocket clients

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use im_relay::config::RelayConfig;
use im_relay::repo::{MemoryMessageRepository, MemoryUserRepository};
use im_relay::server::{DeliveryOutcome, RelayContext};
use im_relay::service::HmacAuthenticator;
use im_relay::store::MemoryStore;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (Arc<RelayContext>, SocketAddr, Arc<HmacAuthenticator>) {
    let config = RelayConfig::default();
    let authenticator = Arc::new(HmacAuthenticator::new(config.auth.secret.clone()));
    let ctx = Arc::new(RelayContext::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryUserRepository::with_users(&[(1, "alice"), (2, "bob")])),
        Arc::new(MemoryMessageRepository::new()),
        authenticator.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ctx.clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    (ctx, addr, authenticator)
}

async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/?token={token}"))
        .await
        .expect("handshake failed");
    ws
}

/// 跳过 ping 等控制帧，取下一个 JSON 文本帧
/// Skip control frames and return the next JSON text frame.
async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn wait_connected(ctx: &RelayContext, user_id: u64) {
    for _ in 0..100 {
        if ctx.registry.is_connected(user_id) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("user {user_id} never registered");
}

#[tokio::test]
async fn test_live_chat_delivery() {
    let (ctx, addr, auth) = start_relay().await;
    let token = auth.issue_token(2, "bob", Duration::from_secs(60));
    let mut bob = connect(addr, &token).await;
    wait_connected(&ctx, 2).await;

    let (message, outcome) = ctx.send_message(1, 2, "hello bob").await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::LiveSent);

    let frame = next_json(&mut bob).await;
    assert_eq!(frame["type"], "chat");
    assert_eq!(frame["from"], 1);
    assert_eq!(frame["to"], 2);
    assert_eq!(frame["content"], "hello bob");
    assert_eq!(frame["msg_id"], message.id);

    // the handshake flipped presence online
    assert!(ctx.presence.is_online(2).await.unwrap());
}

#[tokio::test]
async fn test_offline_backlog_replays_on_connect() {
    let (ctx, addr, auth) = start_relay().await;

    // bob is offline, the message parks
    let (message, outcome) = ctx.send_message(1, 2, "while you were away").await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::Queued);
    assert_eq!(ctx.offline.count(2).await.unwrap(), 1);

    let token = auth.issue_token(2, "bob", Duration::from_secs(60));
    let mut bob = connect(addr, &token).await;

    let parked = next_json(&mut bob).await;
    assert_eq!(parked["type"], "offline_message");
    assert_eq!(parked["sender_id"], 1);
    assert_eq!(parked["content"], "while you were away");
    assert_eq!(parked["id"], message.id);

    // the durable unread replay overlaps; clients dedupe on the message id
    let unread = next_json(&mut bob).await;
    assert_eq!(unread["type"], "chat");
    assert_eq!(unread["msg_id"], message.id);

    // fully replayed backlog is cleared
    let mut cleared = false;
    for _ in 0..100 {
        if ctx.offline.count(2).await.unwrap() == 0 {
            cleared = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared, "offline queue never cleared");
}

#[tokio::test]
async fn test_ack_read_over_wire() {
    let (ctx, addr, auth) = start_relay().await;
    let token = auth.issue_token(2, "bob", Duration::from_secs(60));
    let mut bob = connect(addr, &token).await;
    wait_connected(&ctx, 2).await;

    let (message, _) = ctx.send_message(1, 2, "read me").await.unwrap();
    let _ = next_json(&mut bob).await;

    // let the unread job land before acking, so the decrement has effect
    for _ in 0..100 {
        if ctx.unread.get(2).await.unwrap().is_some() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    bob.send(Message::Text(format!(
        r#"{{"type":"ack_read","msg_id":{}}}"#,
        message.id
    )))
    .await
    .unwrap();

    let mut acked = false;
    for _ in 0..100 {
        if ctx.messages.get_by_id(message.id).await.unwrap().unwrap().is_read {
            acked = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(acked, "ack_read never reached the repository");
    assert_eq!(ctx.unread.get(2).await.unwrap(), None);
}

#[tokio::test]
async fn test_garbage_and_foreign_acks_are_ignored() {
    let (ctx, addr, auth) = start_relay().await;
    let token = auth.issue_token(1, "alice", Duration::from_secs(60));
    let mut alice = connect(addr, &token).await;
    wait_connected(&ctx, 1).await;

    // a message alice sent; she is not its recipient
    let (message, _) = ctx.send_message(1, 2, "for bob").await.unwrap();

    alice.send(Message::Text("not json at all".into())).await.unwrap();
    alice
        .send(Message::Text(r#"{"type":"warp_drive"}"#.into()))
        .await
        .unwrap();
    alice
        .send(Message::Text(format!(
            r#"{{"type":"ack_read","msg_id":"{}"}}"#,
            message.id
        )))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    // nothing marked read, and the connection survived all three frames
    assert!(!ctx.messages.get_by_id(message.id).await.unwrap().unwrap().is_read);

    let (reply, outcome) = ctx.send_message(2, 1, "still there?").await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::LiveSent);
    let frame = next_json(&mut alice).await;
    assert_eq!(frame["msg_id"], reply.id);
}

#[tokio::test]
async fn test_second_login_displaces_first() {
    let (ctx, addr, auth) = start_relay().await;
    let token = auth.issue_token(2, "bob", Duration::from_secs(60));
    let mut first = connect(addr, &token).await;
    wait_connected(&ctx, 2).await;

    let mut second = connect(addr, &token).await;

    // the displaced socket is closed by the server
    let mut displaced = false;
    for _ in 0..100 {
        match timeout(Duration::from_secs(3), first.next()).await.expect("no close seen") {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {
                displaced = true;
                break;
            }
            Some(Ok(_)) => continue,
        }
    }
    assert!(displaced, "first socket never closed");

    // deliveries reach the new socket, and the user never went offline
    let (message, outcome) = ctx.send_message(1, 2, "take two").await.unwrap();
    assert_eq!(outcome, DeliveryOutcome::LiveSent);
    let frame = next_json(&mut second).await;
    assert_eq!(frame["msg_id"], message.id);
    assert!(ctx.registry.is_connected(2));
    assert!(ctx.presence.is_online(2).await.unwrap());
}

#[tokio::test]
async fn test_bad_token_gets_policy_close() {
    let (ctx, addr, _auth) = start_relay().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/?token=garbage"))
        .await
        .expect("handshake should complete before the auth close");

    let mut closed = false;
    for _ in 0..100 {
        match timeout(Duration::from_secs(3), ws.next()).await.expect("no close seen") {
            Some(Ok(Message::Close(frame))) => {
                let frame = frame.expect("close frame should carry a reason");
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason, "unauthorized");
                closed = true;
                break;
            }
            None | Some(Err(_)) => {
                closed = true;
                break;
            }
            Some(Ok(_)) => continue,
        }
    }
    assert!(closed, "server never closed the unauthorized socket");
    assert_eq!(ctx.registry.connected_count(), 0);
}

#[tokio::test]
async fn test_token_via_subprotocol_header() {
    let (ctx, addr, auth) = start_relay().await;
    let token = auth.issue_token(2, "bob", Duration::from_secs(60));

    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        format!("Bearer {token}").parse().unwrap(),
    );
    let (_ws, response) = connect_async(request).await.unwrap();

    // the server must echo the subprotocol per RFC 6455
    assert!(response.headers().get("Sec-WebSocket-Protocol").is_some());
    wait_connected(&ctx, 2).await;
}
