use std::time::Duration;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::FastStore;

/// 有界的 JSON 数组缓存 / Bounded JSON-array cache
///
/// One fast-store string key holding a whole serialized array, newest first.
/// Every write truncates to `capacity` and re-arms the TTL; a payload that no
/// longer deserializes counts as a miss and will be rebuilt by the caller.
/// Both the per-conversation message cache and the per-user conversation
/// summaries are instances of this.
#[derive(Debug, Clone, Copy)]
pub struct BoundedJsonList {
    capacity: usize,
    ttl: Duration,
}

impl BoundedJsonList {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 读取整个数组；未命中或损坏返回 None / Read the array; miss and corrupt both yield None
    pub async fn read<T: DeserializeOwned>(
        &self,
        store: &dyn FastStore,
        key: &str,
    ) -> Result<Option<Vec<T>>> {
        let Some(payload) = store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Vec<T>>(&payload) {
            Ok(items) => Ok(Some(items)),
            Err(err) => {
                debug!("discarding corrupt cache payload at {key}: {err}");
                Ok(None)
            }
        }
    }

    /// 截断、序列化并整体覆盖写入 / Truncate, serialize and overwrite in one shot
    pub async fn write<T: Serialize>(
        &self,
        store: &dyn FastStore,
        key: &str,
        items: &[T],
    ) -> Result<()> {
        let window = &items[..items.len().min(self.capacity)];
        let payload = serde_json::to_string(window)?;
        store.set_ex(key, &payload, self.ttl).await
    }

    /// 头插一条并保持容量上限 / Prepend one item, keeping the capacity bound
    pub async fn push_front<T>(&self, store: &dyn FastStore, key: &str, item: T) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut items: Vec<T> = self.read(store, key).await?.unwrap_or_default();
        items.insert(0, item);
        self.write(store, key, &items).await
    }

    pub async fn clear(&self, store: &dyn FastStore, key: &str) -> Result<()> {
        store.del(key).await
    }
}
