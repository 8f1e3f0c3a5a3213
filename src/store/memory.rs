use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::FastStore;

/// 进程内快存后端 / In-process fast-store backend
///
/// Single-node stand-in for Redis with the same observable behavior: lazy
/// TTL eviction, typed keys, empty lists and sets disappear. Default backend
/// for development and tests.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= Instant::now())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 惰性过期：访问前先清掉到期键 / Lazy expiry, evict the key if its TTL has passed
    fn drop_expired(map: &mut HashMap<String, Entry>, key: &str) {
        if map.get(key).is_some_and(Entry::expired) {
            map.remove(key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Redis 风格的区间归一化，stop 为闭区间 / Redis-style range normalization, stop inclusive
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        match map.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => bail!("wrong type: key {key} does not hold a string"),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut map = self.entries.write();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        Ok(map.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        match map.get_mut(key) {
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(delta.to_string()),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => {
                let current: i64 = s
                    .parse()
                    .map_err(|_| anyhow::anyhow!("value at key {key} is not an integer"))?;
                let next = current + delta;
                *s = next.to_string();
                Ok(next)
            }
            Some(_) => bail!("wrong type: key {key} does not hold a counter"),
        }
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.incr_by(key, -delta).await
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                for value in values {
                    list.push_front(value.clone());
                }
                Ok(list.len() as u64)
            }
            _ => bail!("wrong type: key {key} does not hold a list"),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        match map.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(match normalize_range(list.len(), start, stop) {
                Some((start, stop)) => list.iter().skip(start).take(stop - start + 1).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => bail!("wrong type: key {key} does not hold a list"),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        let emptied = match map.get_mut(key) {
            None => false,
            Some(Entry {
                value: Value::List(list),
                ..
            }) => match normalize_range(list.len(), start, stop) {
                Some((start, stop)) => {
                    let kept: VecDeque<String> =
                        list.iter().skip(start).take(stop - start + 1).cloned().collect();
                    *list = kept;
                    list.is_empty()
                }
                None => {
                    list.clear();
                    true
                }
            },
            Some(_) => bail!("wrong type: key {key} does not hold a list"),
        };
        if emptied {
            map.remove(key);
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        match map.get(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => bail!("wrong type: key {key} does not hold a list"),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => bail!("wrong type: key {key} does not hold a set"),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        let (removed, emptied) = match map.get_mut(key) {
            None => (false, false),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => (set.remove(member), set.is_empty()),
            Some(_) => bail!("wrong type: key {key} does not hold a set"),
        };
        if emptied {
            map.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut map = self.entries.write();
        Self::drop_expired(&mut map, key);
        match map.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => bail!("wrong type: key {key} does not hold a set"),
        }
    }
}
