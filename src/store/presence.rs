use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FastStore;
use crate::domain::UserStatus;

/// 在线记录键前缀 / Presence record key prefix
const PRESENCE_KEY_PREFIX: &str = "im:presence:user:";
/// 在线用户集合键 / Online user id set key
const ONLINE_USERS_KEY: &str = "im:online:users";

/// 单个用户的在线记录 / Presence record for a single user
///
/// Exists only while the user is considered online. A record that outlives
/// its connection (crashed client, lost disconnect) ages out via TTL and is
/// pruned from the id set on the next read or sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: u64,
    pub username: String,
    pub status: UserStatus,
    pub last_seen: DateTime<Utc>,
    pub connected: bool,
}

/// 在线状态追踪器 / Presence tracker
///
/// Best-effort view over the fast store: the record key answers "is this user
/// online", the id set makes "who is online" enumerable without a key scan.
/// The set may briefly contain ids whose record already expired; every reader
/// self-heals by dropping such ids.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn FastStore>,
    ttl: Duration,
}

fn presence_key(user_id: u64) -> String {
    format!("{PRESENCE_KEY_PREFIX}{user_id}")
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn FastStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// 标记上线：写入记录并加入在线集合 / Mark online: write the record, join the id set
    pub async fn set_online(&self, user_id: u64, username: &str) -> Result<()> {
        let record = PresenceRecord {
            user_id,
            username: username.to_string(),
            status: UserStatus::Online,
            last_seen: Utc::now(),
            connected: true,
        };
        let payload = serde_json::to_string(&record)?;
        self.store
            .set_ex(&presence_key(user_id), &payload, self.ttl)
            .await?;
        self.store
            .sadd(ONLINE_USERS_KEY, &user_id.to_string())
            .await?;
        Ok(())
    }

    /// 标记下线：删除记录并移出在线集合 / Mark offline: drop the record and the set membership
    pub async fn set_offline(&self, user_id: u64) -> Result<()> {
        self.store.del(&presence_key(user_id)).await?;
        self.store
            .srem(ONLINE_USERS_KEY, &user_id.to_string())
            .await?;
        Ok(())
    }

    /// 心跳续期；false 表示当前并无在线记录可续
    /// Re-arm the TTL; false means there was no live record to refresh
    pub async fn refresh(&self, user_id: u64) -> Result<bool> {
        self.store.expire(&presence_key(user_id), self.ttl).await
    }

    pub async fn is_online(&self, user_id: u64) -> Result<bool> {
        self.store.exists(&presence_key(user_id)).await
    }

    pub async fn get(&self, user_id: u64) -> Result<Option<PresenceRecord>> {
        let Some(payload) = self.store.get(&presence_key(user_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                debug!("discarding corrupt presence record for user {user_id}: {err}");
                Ok(None)
            }
        }
    }

    /// 枚举在线用户并顺手清理失效成员
    /// Enumerate online users, pruning stale set members on the way
    pub async fn list_online(&self) -> Result<Vec<PresenceRecord>> {
        let members = self.store.smembers(ONLINE_USERS_KEY).await?;
        let mut records = Vec::with_capacity(members.len());
        for member in members {
            let Ok(user_id) = member.parse::<u64>() else {
                self.store.srem(ONLINE_USERS_KEY, &member).await?;
                continue;
            };
            match self.get(user_id).await? {
                Some(record) => records.push(record),
                None => {
                    self.store.srem(ONLINE_USERS_KEY, &member).await?;
                }
            }
        }
        Ok(records)
    }

    /// 清理已过期的集合成员，返回清理数量
    /// Drop set members whose record expired, returning how many went
    pub async fn sweep_expired(&self) -> Result<usize> {
        let members = self.store.smembers(ONLINE_USERS_KEY).await?;
        let mut pruned = 0;
        for member in members {
            let stale = match member.parse::<u64>() {
                Ok(user_id) => !self.store.exists(&presence_key(user_id)).await?,
                Err(_) => true,
            };
            if stale {
                self.store.srem(ONLINE_USERS_KEY, &member).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("presence sweep pruned {pruned} stale entries");
        }
        Ok(pruned)
    }
}
