use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;

/// 中继服务配置 / Relay service configuration
///
/// Layered lookup: `config/default.toml` (optional) < an explicit `--config`
/// file < `IM_RELAY_*` environment variables (`__` separates nested keys,
/// e.g. `IM_RELAY_SERVER__PORT=9000`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub websocket: WebSocketConfig,
    pub presence: PresenceConfig,
    pub offline: OfflineConfig,
    pub cache: CacheConfig,
    pub unread: UnreadConfig,
    pub jobs: JobConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC 签名密钥，生产环境必须覆盖 / HMAC signing secret, override in production
    pub secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: "im-relay-dev-secret".to_string(),
            token_ttl_secs: 86_400,
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 为空时使用进程内内存快存 / Empty selects the in-process memory store
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
    /// 每连接出站队列容量，满则丢帧 / Per-connection outbound queue, frames dropped when full
    pub outbound_queue_size: usize,
    /// 重连时一次补推的离线消息上限 / Offline messages replayed per reconnect
    pub drain_limit: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            read_timeout_secs: 90,
            outbound_queue_size: 256,
            drain_limit: 50,
        }
    }
}

impl WebSocketConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// 在线记录的存活时间，约等于两个客户端心跳周期
    /// Presence record lifetime, roughly two client heartbeat periods
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 120,
            sweep_interval_secs: 60,
        }
    }
}

impl PresenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// 每个收件人保留的离线消息条数 / Offline messages kept per recipient
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl OfflineConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// 每个会话缓存的最近消息条数 / Recent messages cached per conversation
    pub max_messages: usize,
    /// 每个用户缓存的会话摘要条数 / Conversation summaries cached per user
    pub max_conversations: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_messages: 30,
            max_conversations: 10,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnreadConfig {
    pub ttl_secs: u64,
}

impl Default for UnreadConfig {
    fn default() -> Self {
        Self { ttl_secs: 86_400 }
    }
}

impl UnreadConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// 副作用任务队列容量，满则丢弃并告警 / Side-effect job queue, overflow drops with a warning
    pub queue_size: usize,
    pub workers: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 加载配置：默认文件 + 可选显式文件 + 环境变量
/// Load configuration from the default file, an optional explicit file and the environment
pub fn load(path: Option<&Path>) -> anyhow::Result<RelayConfig> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path));
    }

    // prefix_separator keeps the documented IM_RELAY_SECTION__KEY shape;
    // without it the prefix would also expect the double underscore
    builder = builder.add_source(
        Environment::with_prefix("IM_RELAY")
            .separator("__")
            .prefix_separator("_")
            .ignore_empty(true),
    );

    let settings = builder.build().context("failed to assemble configuration")?;
    settings
        .try_deserialize()
        .context("failed to deserialize configuration")
}
