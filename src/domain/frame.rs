use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use super::message::Message;

/// 客户端上行帧 / Frames a client may send over the socket
///
/// The tag set is closed: anything that does not parse into one of these
/// variants is dropped by the reader without a reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 应用层心跳，刷新在线存在 / Application heartbeat, refreshes presence
    Heartbeat,
    /// 已读回执 / Read receipt for a delivered message
    AckRead {
        #[serde(deserialize_with = "lenient_u64")]
        msg_id: u64,
    },
}

/// 服务端下行帧 / Frames the relay pushes to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// 实时私聊消息 / A live chat message
    Chat {
        from: u64,
        to: u64,
        content: String,
        msg_id: u64,
        timestamp: i64,
    },
    /// 重连补推的离线消息 / An offline message replayed on reconnect
    OfflineMessage {
        id: u64,
        sender_id: u64,
        content: String,
        created_at: String,
    },
}

impl ServerFrame {
    pub fn chat(message: &Message) -> Self {
        ServerFrame::Chat {
            from: message.sender_id,
            to: message.receiver_id,
            content: message.content.clone(),
            msg_id: message.id,
            timestamp: message.created_at.timestamp(),
        }
    }
}

/// 兼容数字与数字字符串两种写法的 msg_id
/// Accepts both a JSON number and a numeric string for msg_id
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom("msg_id must be a non-negative integer")),
        serde_json::Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| de::Error::custom("msg_id string must be numeric")),
        other => Err(de::Error::custom(format!(
            "msg_id must be a number or numeric string, got {other}"
        ))),
    }
}
