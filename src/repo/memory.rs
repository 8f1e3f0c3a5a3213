use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{MessageRepository, UserRepository};
use crate::domain::{Message, NewMessage, User, UserStatus};

/// 内存用户仓储，用于测试与单机开发 / In-memory user repository for tests and single-node runs
#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<u64, User>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    /// 便捷构造：按 id 列表预置离线用户 / Seed offline users from a list of (id, username)
    pub fn with_users(users: &[(u64, &str)]) -> Self {
        let repo = Self::new();
        for (id, username) in users {
            repo.insert(User {
                id: *id,
                username: username.to_string(),
                nickname: username.to_string(),
                status: UserStatus::Offline,
                last_seen: Utc::now(),
            });
        }
        repo
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get_by_id(&self, id: u64) -> Result<Option<User>> {
        Ok(self.users.read().get(&id).cloned())
    }

    async fn update_status(&self, id: u64, status: UserStatus) -> Result<()> {
        if let Some(user) = self.users.write().get_mut(&id) {
            user.status = status;
            user.last_seen = Utc::now();
        }
        Ok(())
    }
}

/// 内存消息仓储 / In-memory message repository
pub struct MemoryMessageRepository {
    messages: RwLock<Vec<Message>>,
    next_id: AtomicU64,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for MemoryMessageRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// 最新在前；时间相同以较大 id 在前 / Newest first; equal timestamps put the higher id first
fn newest_first(messages: &mut [Message]) {
    messages.sort_by(|x, y| {
        y.created_at
            .cmp(&x.created_at)
            .then_with(|| y.id.cmp(&x.id))
    });
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create(&self, draft: NewMessage) -> Result<Message> {
        let now = Utc::now();
        let message = Message {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            content: draft.content,
            kind: draft.kind,
            is_read: false,
            created_at: now,
            updated_at: now,
        };
        self.messages.write().push(message.clone());
        Ok(message)
    }

    async fn get_by_id(&self, id: u64) -> Result<Option<Message>> {
        Ok(self.messages.read().iter().find(|m| m.id == id).cloned())
    }

    async fn conversation_page(
        &self,
        user_a: u64,
        user_b: u64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let mut page: Vec<Message> = self
            .messages
            .read()
            .iter()
            .filter(|m| {
                (m.sender_id == user_a && m.receiver_id == user_b)
                    || (m.sender_id == user_b && m.receiver_id == user_a)
            })
            .cloned()
            .collect();
        newest_first(&mut page);
        Ok(page.into_iter().skip(offset).take(limit).collect())
    }

    async fn unread_for(&self, receiver: u64) -> Result<Vec<Message>> {
        let mut unread: Vec<Message> = self
            .messages
            .read()
            .iter()
            .filter(|m| m.receiver_id == receiver && !m.is_read)
            .cloned()
            .collect();
        unread.sort_by(|x, y| {
            x.created_at
                .cmp(&y.created_at)
                .then_with(|| x.id.cmp(&y.id))
        });
        Ok(unread)
    }

    async fn mark_read(&self, id: u64) -> Result<()> {
        if let Some(message) = self.messages.write().iter_mut().find(|m| m.id == id) {
            message.is_read = true;
            message.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_conversation_read(&self, receiver: u64, sender: u64) -> Result<u64> {
        let mut updated = 0;
        for message in self.messages.write().iter_mut() {
            if message.receiver_id == receiver && message.sender_id == sender && !message.is_read {
                message.is_read = true;
                message.updated_at = Utc::now();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_all_read(&self, receiver: u64) -> Result<u64> {
        let mut updated = 0;
        for message in self.messages.write().iter_mut() {
            if message.receiver_id == receiver && !message.is_read {
                message.is_read = true;
                message.updated_at = Utc::now();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_unread(&self, receiver: u64) -> Result<i64> {
        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| m.receiver_id == receiver && !m.is_read)
            .count() as i64)
    }

    async fn count_unread_between(&self, receiver: u64, sender: u64) -> Result<i64> {
        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| m.receiver_id == receiver && m.sender_id == sender && !m.is_read)
            .count() as i64)
    }

    async fn recent_involving(&self, user: u64, limit: usize) -> Result<Vec<Message>> {
        let mut involving: Vec<Message> = self
            .messages
            .read()
            .iter()
            .filter(|m| m.sender_id == user || m.receiver_id == user)
            .cloned()
            .collect();
        newest_first(&mut involving);
        involving.truncate(limit);
        Ok(involving)
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.messages.write().retain(|m| m.id != id);
        Ok(())
    }
}
