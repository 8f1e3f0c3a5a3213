use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FastStore;
use crate::domain::{Message, ServerFrame};

/// 离线消息键前缀 / Offline queue key prefix
const OFFLINE_KEY_PREFIX: &str = "im:offline:";

/// 暂存的离线消息 / A parked offline message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineMessage {
    pub id: u64,
    pub sender_id: u64,
    pub receiver_id: u64,
    pub content: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

impl OfflineMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content.clone(),
            kind: message.kind.clone(),
            created_at: message.created_at,
        }
    }

    /// 从实时帧降级而来（收件人刚好不在线)
    /// Built from a live frame whose recipient turned out to be offline
    pub fn from_chat_frame(frame: &ServerFrame) -> Option<Self> {
        match frame {
            ServerFrame::Chat {
                from,
                to,
                content,
                msg_id,
                timestamp,
            } => Some(Self {
                id: *msg_id,
                sender_id: *from,
                receiver_id: *to,
                content: content.clone(),
                kind: crate::domain::message::KIND_TEXT.to_string(),
                created_at: Utc
                    .timestamp_opt(*timestamp, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            }),
            _ => None,
        }
    }

    /// 重连补推使用的下行帧 / The frame replayed to a reconnecting client
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::OfflineMessage {
            id: self.id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            created_at: self.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// 每收件人的离线消息队列 / Per-recipient offline message queue
///
/// Fast-store list, newest at the head, silently capped at `capacity` so an
/// absent user cannot grow state without bound. Entries also age out whole-key
/// via TTL. Draining does not delete; the caller clears only after a
/// successful replay, so a crash mid-replay re-delivers rather than loses.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn FastStore>,
    capacity: usize,
    ttl: Duration,
}

fn offline_key(recipient: u64) -> String {
    format!("{OFFLINE_KEY_PREFIX}{recipient}")
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn FastStore>, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            capacity,
            ttl,
        }
    }

    /// 入队并执行容量与 TTL 管控 / Enqueue, then enforce the cap and re-arm the TTL
    pub async fn enqueue(&self, message: &OfflineMessage) -> Result<()> {
        let key = offline_key(message.receiver_id);
        let payload = serde_json::to_string(message)?;
        self.store.lpush(&key, &[payload]).await?;
        self.store.expire(&key, self.ttl).await?;
        self.store.ltrim(&key, 0, self.capacity as i64 - 1).await?;
        Ok(())
    }

    /// 批量入队，保持 slice 中靠后的元素更新 / Batch enqueue; later slice elements are newer
    pub async fn enqueue_batch(&self, recipient: u64, messages: &[OfflineMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let key = offline_key(recipient);
        let mut payloads = Vec::with_capacity(messages.len());
        for message in messages {
            payloads.push(serde_json::to_string(message)?);
        }
        self.store.lpush(&key, &payloads).await?;
        self.store.expire(&key, self.ttl).await?;
        self.store.ltrim(&key, 0, self.capacity as i64 - 1).await?;
        Ok(())
    }

    /// 读取最多 limit 条最新条目，不删除；损坏条目跳过
    /// Read up to `limit` newest entries without deleting; corrupt entries are skipped
    pub async fn drain(&self, recipient: u64, limit: usize) -> Result<Vec<OfflineMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = offline_key(recipient);
        let payloads = self.store.lrange(&key, 0, limit as i64 - 1).await?;
        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str(&payload) {
                Ok(message) => messages.push(message),
                Err(err) => debug!("skipping corrupt offline entry for user {recipient}: {err}"),
            }
        }
        Ok(messages)
    }

    /// 重放成功后整队清除 / Drop the whole queue after a successful replay
    pub async fn clear(&self, recipient: u64) -> Result<()> {
        self.store.del(&offline_key(recipient)).await
    }

    pub async fn count(&self, recipient: u64) -> Result<u64> {
        self.store.llen(&offline_key(recipient)).await
    }

    /// 撤回单条离线消息，保持其余条目的相对顺序
    /// Remove one parked message, preserving the order of the rest
    pub async fn remove(&self, recipient: u64, message_id: u64) -> Result<bool> {
        let all = self.drain(recipient, self.capacity).await?;
        let kept: Vec<OfflineMessage> = all
            .iter()
            .filter(|m| m.id != message_id)
            .cloned()
            .collect();
        if kept.len() == all.len() {
            return Ok(false);
        }
        self.clear(recipient).await?;
        // rebuild oldest-first so the newest entry lands back at the head
        let oldest_first: Vec<OfflineMessage> = kept.into_iter().rev().collect();
        self.enqueue_batch(recipient, &oldest_first).await?;
        Ok(true)
    }
}
