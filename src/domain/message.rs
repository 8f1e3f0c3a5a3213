use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息类型 / Message payload kind
///
/// Stored as a plain lowercase string so future kinds (image, file …) can be
/// carried through without a schema change on the durable side.
pub type MessageKind = String;

/// 默认的消息类型 / Default message kind
pub const KIND_TEXT: &str = "text";

/// 持久化的私聊消息 / A persisted 1:1 chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub sender_id: u64,
    pub receiver_id: u64,
    pub content: String,
    pub kind: MessageKind,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待持久化的新消息：id 与时间戳由仓储分配
/// A message about to be persisted; id and timestamps are assigned by the repository
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: u64,
    pub receiver_id: u64,
    pub content: String,
    pub kind: MessageKind,
}

impl NewMessage {
    pub fn text(sender_id: u64, receiver_id: u64, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            content: content.into(),
            kind: KIND_TEXT.to_string(),
        }
    }
}

/// 用户在线状态（落库字段）/ Durable user online status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
        }
    }
}

/// 用户档案（中继只读取，不负责注册）
/// User profile; the relay reads it but account provisioning lives elsewhere
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub nickname: String,
    pub status: UserStatus,
    pub last_seen: DateTime<Utc>,
}
