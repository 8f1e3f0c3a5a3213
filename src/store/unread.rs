use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use super::FastStore;

/// 未读计数键前缀 / Unread counter key prefix
const UNREAD_KEY_PREFIX: &str = "im:unread:";

/// 每用户未读总数计数器 / Per-user total unread counter
///
/// A hint, not a ledger: the durable store can always recompute it. The key
/// is deleted once the count falls to zero or below, so "absent" uniformly
/// means "nothing cached, recompute if you care".
#[derive(Clone)]
pub struct UnreadCounter {
    store: Arc<dyn FastStore>,
    ttl: Duration,
}

fn unread_key(user_id: u64) -> String {
    format!("{UNREAD_KEY_PREFIX}{user_id}")
}

impl UnreadCounter {
    pub fn new(store: Arc<dyn FastStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// 自增并续期，返回新值 / Increment, re-arm the TTL and return the new value
    pub async fn increment(&self, user_id: u64) -> Result<i64> {
        let key = unread_key(user_id);
        let value = self.store.incr_by(&key, 1).await?;
        self.store.expire(&key, self.ttl).await?;
        Ok(value)
    }

    /// 自减；归零或变负即删除键 / Decrement; the key is dropped at zero or below
    pub async fn decrement(&self, user_id: u64) -> Result<()> {
        let key = unread_key(user_id);
        let value = self.store.decr_by(&key, 1).await?;
        if value <= 0 {
            self.store.del(&key).await?;
        }
        Ok(())
    }

    /// None 表示无缓存值，调用方自行决定是否回源
    /// None means nothing cached; the caller decides whether to recompute
    pub async fn get(&self, user_id: u64) -> Result<Option<i64>> {
        let key = unread_key(user_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match raw.parse::<i64>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                // self-heal, otherwise the next increment would error out
                debug!("dropping corrupt unread counter for user {user_id}");
                self.store.del(&key).await?;
                Ok(None)
            }
        }
    }

    /// 以持久层权威值覆盖；零保持键缺失的惯例
    /// Overwrite with an authoritative durable count; zero keeps the absence convention
    pub async fn set(&self, user_id: u64, count: i64) -> Result<()> {
        let key = unread_key(user_id);
        if count <= 0 {
            return self.store.del(&key).await;
        }
        self.store.set_ex(&key, &count.to_string(), self.ttl).await
    }

    pub async fn reset(&self, user_id: u64) -> Result<()> {
        self.store.del(&unread_key(user_id)).await
    }

    /// 群发场景的批量自增 / Batch increment for fan-out writes
    pub async fn batch_increment(&self, user_ids: &[u64], delta: i64) -> Result<()> {
        for &user_id in user_ids {
            let key = unread_key(user_id);
            self.store.incr_by(&key, delta).await?;
            self.store.expire(&key, self.ttl).await?;
        }
        Ok(())
    }

    /// 批量自减，同样在归零时删除 / Batch decrement, dropping keys that reach zero
    pub async fn batch_decrement(&self, user_ids: &[u64], delta: i64) -> Result<()> {
        for &user_id in user_ids {
            let key = unread_key(user_id);
            let value = self.store.decr_by(&key, delta).await?;
            if value <= 0 {
                self.store.del(&key).await?;
            }
        }
        Ok(())
    }
}
