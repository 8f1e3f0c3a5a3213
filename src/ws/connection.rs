//! 单个 WebSocket 连接的生命周期：握手、认证、收发与下线
//! Lifecycle of a single WebSocket connection: handshake, auth, pumps, teardown

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::domain::UserStatus;
use crate::server::RelayContext;
use crate::ws::handler;

/// 从升级请求中提取令牌：优先 `?token=` 查询参数，其次 Sec-WebSocket-Protocol 头
/// Token comes from the `?token=` query parameter, falling back to the
/// Sec-WebSocket-Protocol header (with an optional `Bearer ` prefix).
fn extract_token(request: &Request) -> Option<String> {
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if value.is_empty() {
                    continue;
                }
                return match urlencoding::decode(value) {
                    Ok(decoded) => Some(decoded.into_owned()),
                    Err(_) => Some(value.to_string()),
                };
            }
        }
    }

    let header = request.headers().get("Sec-WebSocket-Protocol")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// 处理一条客户端连接，直到对端断开或超时
/// Drive one client connection until the peer disconnects or times out.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<RelayContext>,
) -> Result<()> {
    info!("📨 New connection from: {}", peer_addr);

    let mut token: Option<String> = None;
    let mut ws_stream = accept_hdr_async(stream, |request: &Request, mut response: Response| {
        token = extract_token(request);
        // 客户端把令牌塞进子协议头时必须原样回显，否则浏览器会拒绝握手
        // Echo the subprotocol header back or browsers abort the handshake.
        if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", protocol.clone());
        }
        Ok(response)
    })
    .await?;

    let claims = match token {
        Some(token) => match ctx.authenticator.validate_token(&token).await {
            Ok(claims) => claims,
            Err(err) => {
                info!("rejecting connection from {}: {}", peer_addr, err);
                let _ = ws_stream
                    .close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: "unauthorized".into(),
                    }))
                    .await;
                return Ok(());
            }
        },
        None => {
            info!("rejecting connection from {}: no token presented", peer_addr);
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "unauthorized".into(),
                }))
                .await;
            return Ok(());
        }
    };

    let user_id = claims.user_id;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // 注册连接；同一用户的旧连接被顶下线
    // Register the connection; an older connection of the same user is displaced.
    let (handle, mut rx) = ctx.registry.admit(user_id);
    info!("✅ User {} ({}) connected from {}", user_id, claims.username, peer_addr);

    if let Err(err) = ctx.presence.set_online(user_id, &claims.username).await {
        warn!("failed to record presence for user {}: {:#}", user_id, err);
    }
    if let Err(err) = ctx.users.update_status(user_id, UserStatus::Online).await {
        warn!("failed to persist online status for user {}: {:#}", user_id, err);
    }

    // 写泵：下行帧 + 周期心跳 ping
    // Writer pump: outbound frames plus periodic pings.
    let ping_interval = ctx.config.websocket.ping_interval();
    let send_task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            error!("failed to serialize outbound frame: {}", err);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if ws_sender.send(Message::Ping(b"ping".to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    // 上线即补投离线积压和未读历史
    // Replay parked backlog and unread history right after coming online.
    let backlog_ctx = ctx.clone();
    tokio::spawn(async move {
        backlog_ctx.replay_backlog(user_id).await;
    });

    let read_timeout = ctx.config.websocket.read_timeout();
    loop {
        match tokio::time::timeout(read_timeout, ws_receiver.next()).await {
            Err(_) => {
                info!("⏰ User {} read timeout, closing connection", user_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!("websocket error from user {}: {}", user_id, err);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                handler::dispatch_frame(&ctx, user_id, &text).await;
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            // Ping/Pong/Binary 仅用于刷新读超时
            // Pings, pongs and binary frames just reset the read deadline.
            Ok(Some(Ok(_))) => {}
        }
    }

    // 只有仍持有注册表槽位的连接才能把用户标记下线，
    // 被顶替的旧连接不得覆盖新连接的在线状态。
    // Only the connection still holding the registry slot may flip the user
    // offline; a displaced connection must not clobber its successor's state.
    if ctx.registry.release(user_id, handle) {
        if let Err(err) = ctx.presence.set_offline(user_id).await {
            warn!("failed to clear presence for user {}: {:#}", user_id, err);
        }
        if let Err(err) = ctx.users.update_status(user_id, UserStatus::Offline).await {
            warn!("failed to persist offline status for user {}: {:#}", user_id, err);
        }
        info!("👋 User {} disconnected", user_id);
    } else {
        debug!("user {} connection {} was displaced, skipping offline transition", user_id, handle);
    }

    send_task.abort();
    Ok(())
}
