//! 入站帧分发
//! Inbound frame dispatch

use crate::domain::{ClientFrame, UserStatus};
use crate::error::RelayError;
use crate::server::RelayContext;
use tracing::{debug, warn};

/// 解析并处理一条入站文本帧。未知或畸形的帧静默忽略，
/// 连接不会因为客户端发了垃圾而被判死。
/// Parse and handle one inbound text frame. Unknown or malformed frames are
/// ignored; a client sending garbage does not kill the connection.
pub async fn dispatch_frame(ctx: &RelayContext, user_id: u64, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!("ignoring unparseable frame from user {}: {}", user_id, err);
            return;
        }
    };

    match frame {
        ClientFrame::Heartbeat => {
            match ctx.presence.refresh(user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("heartbeat from user {} with no live presence record", user_id)
                }
                Err(err) => warn!("failed to refresh presence for user {}: {:#}", user_id, err),
            }
            if let Err(err) = ctx.users.update_status(user_id, UserStatus::Online).await {
                warn!("failed to bump last_seen for user {}: {:#}", user_id, err);
            }
        }
        ClientFrame::AckRead { msg_id } => match ctx.mark_read(msg_id, user_id).await {
            Ok(()) => debug!("user {} acked message {}", user_id, msg_id),
            // 指向别人消息或不存在消息的回执按协议静默丢弃
            // Acks for foreign or missing messages are protocol-silent.
            Err(RelayError::NotFound { .. }) | Err(RelayError::PermissionDenied { .. }) => {
                debug!("ignoring ack from user {} for message {}", user_id, msg_id)
            }
            Err(err) => warn!("failed to mark message {} read: {:#}", msg_id, err),
        },
    }
}
