//! 持久层接口：中继依赖的最小读写面 / Durable-store seams the relay depends on
//!
//! The relay never owns durable state. These traits are the narrow surface it
//! needs from whatever database the deployment uses; the in-memory
//! implementations back tests and single-node development.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{Message, NewMessage, User, UserStatus};

pub mod memory;

pub use memory::{MemoryMessageRepository, MemoryUserRepository};

/// 用户档案读写 / User profile access
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: u64) -> Result<Option<User>>;

    /// 更新在线状态并顺带刷新 last_seen / Update status, bumping last_seen with it
    async fn update_status(&self, id: u64, status: UserStatus) -> Result<()>;
}

/// 消息持久化与查询 / Message persistence and queries
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 分配 id 与时间戳并落库 / Assign id and timestamps, then persist
    async fn create(&self, draft: NewMessage) -> Result<Message>;

    async fn get_by_id(&self, id: u64) -> Result<Option<Message>>;

    /// 双向会话分页，最新在前；时间相同以较大 id 在前
    /// Page through both directions of a conversation, newest first;
    /// ties on the timestamp put the higher id first
    async fn conversation_page(
        &self,
        user_a: u64,
        user_b: u64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>>;

    /// 未读消息，按时间升序供补推 / Unread messages, oldest first for replay
    async fn unread_for(&self, receiver: u64) -> Result<Vec<Message>>;

    async fn mark_read(&self, id: u64) -> Result<()>;

    /// 将某个对端发来的未读全部置已读，返回行数
    /// Mark everything unread from one counterpart as read, returning the row count
    async fn mark_conversation_read(&self, receiver: u64, sender: u64) -> Result<u64>;

    /// 该用户收到的未读全部置已读 / Mark everything unread for the user as read
    async fn mark_all_read(&self, receiver: u64) -> Result<u64>;

    async fn count_unread(&self, receiver: u64) -> Result<i64>;

    async fn count_unread_between(&self, receiver: u64, sender: u64) -> Result<i64>;

    /// 该用户参与的最近消息，最新在前，供摘要重建
    /// Recent messages involving the user, newest first, for summary rebuilds
    async fn recent_involving(&self, user: u64, limit: usize) -> Result<Vec<Message>>;

    async fn delete(&self, id: u64) -> Result<()>;
}
