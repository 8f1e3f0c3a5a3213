use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bounded::BoundedJsonList;
use super::FastStore;
use crate::config::CacheConfig;
use crate::domain::Message;

/// 会话消息缓存键前缀 / Conversation message cache key prefix
const CHAT_KEY_PREFIX: &str = "im:chat:";
/// 会话摘要缓存键前缀 / Conversation summary cache key prefix
const CONVERSATIONS_KEY_PREFIX: &str = "im:conversations:";

/// 会话摘要条目 / One conversation summary entry
///
/// `user_id` is the counterpart, `unread_count` is the owner's best-effort
/// unread total for that counterpart at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedConversation {
    pub user_id: u64,
    pub username: String,
    pub last_message: String,
    pub last_time: DateTime<Utc>,
    pub unread_count: i64,
}

/// 无序对的规范化键 / Canonical ordering for an unordered user pair
///
/// Both directions of a conversation share one cache entry.
pub fn canonical_pair(a: u64, b: u64) -> (u64, u64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn chat_key(a: u64, b: u64) -> String {
    let (lo, hi) = canonical_pair(a, b);
    format!("{CHAT_KEY_PREFIX}{lo}:{hi}")
}

fn conversations_key(owner: u64) -> String {
    format!("{CONVERSATIONS_KEY_PREFIX}{owner}")
}

/// 旁路缓存：最近消息与会话摘要 / Cache-aside recent messages and conversation summaries
///
/// Write path appends on every send, read path serves page one and falls back
/// to the durable store on a miss. Nothing here is a source of truth: a lost
/// key costs one rebuild.
#[derive(Clone)]
pub struct MessageCache {
    store: Arc<dyn FastStore>,
    messages: BoundedJsonList,
    conversations: BoundedJsonList,
}

impl MessageCache {
    pub fn new(store: Arc<dyn FastStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            messages: BoundedJsonList::new(config.max_messages, config.ttl()),
            conversations: BoundedJsonList::new(config.max_conversations, config.ttl()),
        }
    }

    /// 单页可由缓存完整服务的最大条数 / Largest page the cache can serve in full
    pub fn message_window(&self) -> usize {
        self.messages.capacity()
    }

    // ---- 会话消息 / Conversation messages ----

    /// 发送路径的追加写 / Append-on-send for the hot conversation window
    pub async fn append_message(&self, message: &Message) -> Result<()> {
        let key = chat_key(message.sender_id, message.receiver_id);
        self.messages
            .push_front(self.store.as_ref(), &key, message.clone())
            .await
    }

    /// 未命中或损坏返回 None / Returns None on a miss or a corrupt payload
    pub async fn read_messages(&self, a: u64, b: u64) -> Result<Option<Vec<Message>>> {
        self.messages.read(self.store.as_ref(), &chat_key(a, b)).await
    }

    /// 以持久层查询结果重建缓存 / Rebuild the window from a durable query result
    pub async fn populate(&self, a: u64, b: u64, messages: &[Message]) -> Result<()> {
        self.messages
            .write(self.store.as_ref(), &chat_key(a, b), messages)
            .await
    }

    pub async fn clear_messages(&self, a: u64, b: u64) -> Result<()> {
        self.messages.clear(self.store.as_ref(), &chat_key(a, b)).await
    }

    // ---- 会话摘要 / Conversation summaries ----

    /// 更新或插入一条摘要并重排 / Upsert one summary entry and re-sort
    ///
    /// Ordering is most-recent first; equal timestamps fall back to the
    /// counterpart id so the result is deterministic.
    pub async fn upsert_conversation(
        &self,
        owner: u64,
        counterpart: u64,
        counterpart_name: &str,
        preview: &str,
        last_time: DateTime<Utc>,
        unread_count: i64,
    ) -> Result<()> {
        let key = conversations_key(owner);
        let mut entries: Vec<CachedConversation> = self
            .conversations
            .read(self.store.as_ref(), &key)
            .await?
            .unwrap_or_default();

        match entries.iter_mut().find(|e| e.user_id == counterpart) {
            Some(entry) => {
                entry.last_message = preview.to_string();
                entry.last_time = last_time;
                entry.unread_count = unread_count;
                if !counterpart_name.is_empty() {
                    entry.username = counterpart_name.to_string();
                }
            }
            None => entries.push(CachedConversation {
                user_id: counterpart,
                username: counterpart_name.to_string(),
                last_message: preview.to_string(),
                last_time,
                unread_count,
            }),
        }

        sort_summaries(&mut entries);
        self.conversations
            .write(self.store.as_ref(), &key, &entries)
            .await
    }

    pub async fn read_conversations(&self, owner: u64) -> Result<Option<Vec<CachedConversation>>> {
        self.conversations
            .read(self.store.as_ref(), &conversations_key(owner))
            .await
    }

    pub async fn populate_conversations(
        &self,
        owner: u64,
        summaries: &[CachedConversation],
    ) -> Result<()> {
        let mut entries = summaries.to_vec();
        sort_summaries(&mut entries);
        self.conversations
            .write(self.store.as_ref(), &conversations_key(owner), &entries)
            .await
    }

    pub async fn clear_conversations(&self, owner: u64) -> Result<()> {
        self.conversations
            .clear(self.store.as_ref(), &conversations_key(owner))
            .await
    }
}

/// 摘要排序：最近优先，同刻按对端 id / Newest first, ties broken by counterpart id
pub(crate) fn sort_summaries(entries: &mut [CachedConversation]) {
    entries.sort_by(|x, y| {
        y.last_time
            .cmp(&x.last_time)
            .then_with(|| x.user_id.cmp(&y.user_id))
    });
}
