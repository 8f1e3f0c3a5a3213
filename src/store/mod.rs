//! 快存层：易失的在线状态与缓存数据 / Fast-store layer: volatile presence and cache data
//!
//! Everything in here is reconstructible from the durable repositories. The
//! narrow key/value/list/set contract below is what the presence tracker,
//! offline queue, caches and unread counters are written against, so the
//! in-process memory backend and the Redis backend stay interchangeable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

pub mod bounded;
pub mod memory;
pub mod message_cache;
pub mod offline;
pub mod presence;
#[cfg(feature = "redis")]
pub mod redis;
pub mod unread;

pub use bounded::BoundedJsonList;
pub use memory::MemoryStore;
pub use message_cache::{CachedConversation, MessageCache};
pub use offline::{OfflineMessage, OfflineQueue};
pub use presence::{PresenceRecord, PresenceTracker};
#[cfg(feature = "redis")]
pub use redis::RedisStore;
pub use unread::UnreadCounter;

use crate::config::RelayConfig;

/// 快存抽象：按 Redis 的数据模型裁剪 / Fast-store abstraction, cut to Redis's data model
///
/// TTL semantics follow Redis: `set_ex` replaces value and lifetime, list and
/// set writes leave an existing lifetime untouched, `expire` re-arms it.
#[async_trait]
pub trait FastStore: Send + Sync {
    // 字符串 / Strings
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// 返回 false 表示键不存在 / Returns false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // 计数器 / Counters
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64>;

    // 列表 / Lists
    /// 依次头插，最后一个元素成为新表头 / Pushes in order, the last value ends up at the head
    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;
    async fn llen(&self, key: &str) -> Result<u64>;

    // 集合 / Sets
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
}

/// 按配置与编译特性挑选快存后端 / Pick the fast-store backend from config and features
pub async fn build(config: &RelayConfig) -> Result<Arc<dyn FastStore>> {
    if !config.store.redis_url.is_empty() {
        #[cfg(feature = "redis")]
        {
            let store = RedisStore::connect(&config.store.redis_url).await?;
            info!("🔗 fast store: redis at {}", config.store.redis_url);
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis"))]
        tracing::warn!(
            "store.redis_url is set but the redis feature is compiled out, using the memory store"
        );
    }
    info!("🧠 fast store: in-process memory");
    Ok(Arc::new(MemoryStore::new()))
}
