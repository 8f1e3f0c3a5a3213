//! 连接注册表与共享上下文 / Connection registry and the shared relay context

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::domain::ServerFrame;
use crate::repo::{MessageRepository, UserRepository};
use crate::service::auth::Authenticator;
use crate::store::{
    FastStore, MessageCache, OfflineMessage, OfflineQueue, PresenceTracker, UnreadCounter,
};
use crate::tasks::JobQueue;

/// 连接句柄：注销时的防错凭证 / Connection handle, the release-time proof of ownership
///
/// A reconnect replaces the registry entry; the superseded connection still
/// tears itself down later and must not be able to evict its successor. Only
/// the holder of the current handle can release the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle(Uuid);

impl ConnHandle {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 投递结果 / What happened to a frame handed to `deliver`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 已写入在线连接的出站队列 / Queued on a live connection's outbound channel
    LiveSent,
    /// 收件人离线，已转入离线队列 / Recipient offline, parked in the offline queue
    Queued,
    /// 在线但出站队列已满，或帧不可暂存；帧被丢弃
    /// Online but the outbound queue is full, or the frame cannot be parked; dropped
    Dropped,
}

struct LiveConnection {
    handle: ConnHandle,
    sender: mpsc::Sender<ServerFrame>,
}

/// 在线连接注册表 / Live connection registry
///
/// One entry per user id, last connection wins. Each entry owns the sole
/// sender for that connection's bounded outbound queue, so replacing or
/// removing an entry is also what stops the superseded writer task.
pub struct ConnectionRegistry {
    connections: DashMap<u64, LiveConnection>,
    offline: OfflineQueue,
    outbound_queue_size: usize,
}

impl ConnectionRegistry {
    pub fn new(offline: OfflineQueue, outbound_queue_size: usize) -> Self {
        Self {
            connections: DashMap::new(),
            offline,
            outbound_queue_size,
        }
    }

    /// 登记新连接，后来者替换先来者 / Admit a connection, displacing any predecessor
    ///
    /// Returns the guard handle and the receiving end of the outbound queue.
    /// Dropping the predecessor entry closes its channel, which its writer
    /// task observes as end-of-stream.
    pub fn admit(&self, user_id: u64) -> (ConnHandle, mpsc::Receiver<ServerFrame>) {
        let (sender, receiver) = mpsc::channel(self.outbound_queue_size);
        let handle = ConnHandle::generate();
        if self
            .connections
            .insert(user_id, LiveConnection { handle, sender })
            .is_some()
        {
            debug!("user {user_id} reconnected, previous connection displaced");
        }
        (handle, receiver)
    }

    /// 注销连接；仅当句柄仍是当前连接时生效
    /// Release the slot; a no-op unless the handle still owns it
    pub fn release(&self, user_id: u64, handle: ConnHandle) -> bool {
        self.connections
            .remove_if(&user_id, |_, conn| conn.handle == handle)
            .is_some()
    }

    /// 投递一帧：在线走出站队列，离线转离线队列
    /// Deliver one frame: live connections get it queued, absent users get it parked
    ///
    /// A full outbound queue drops the frame rather than parking it; the
    /// recipient is online and backpressure must not fork the delivery path.
    pub async fn deliver(&self, user_id: u64, frame: ServerFrame) -> DeliveryOutcome {
        let frame = match self.connections.get(&user_id) {
            Some(conn) => match conn.sender.try_send(frame) {
                Ok(()) => return DeliveryOutcome::LiveSent,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("outbound queue full for user {user_id}, dropping frame");
                    return DeliveryOutcome::Dropped;
                }
                // channel closed: the connection is mid-teardown, treat as offline
                Err(mpsc::error::TrySendError::Closed(frame)) => frame,
            },
            None => frame,
        };

        let Some(parked) = OfflineMessage::from_chat_frame(&frame) else {
            debug!("user {user_id} offline, dropping non-chat frame");
            return DeliveryOutcome::Dropped;
        };
        match self.offline.enqueue(&parked).await {
            Ok(()) => DeliveryOutcome::Queued,
            Err(err) => {
                warn!("failed to park message for user {user_id}: {err:#}");
                DeliveryOutcome::Dropped
            }
        }
    }

    /// 仅尝试在线投递，绝不落离线队列；补推路径专用
    /// Live-only send that never parks; used by backlog replay
    pub fn try_send_live(&self, user_id: u64, frame: ServerFrame) -> bool {
        match self.connections.get(&user_id) {
            Some(conn) => conn.sender.try_send(frame).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, user_id: u64) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }
}

/// 中继共享上下文 / Shared state threaded through every connection and service call
pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: ConnectionRegistry,
    pub presence: PresenceTracker,
    pub offline: OfflineQueue,
    pub message_cache: MessageCache,
    pub unread: UnreadCounter,
    pub users: Arc<dyn UserRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub authenticator: Arc<dyn Authenticator>,
    pub jobs: JobQueue,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn FastStore>,
        users: Arc<dyn UserRepository>,
        messages: Arc<dyn MessageRepository>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let offline = OfflineQueue::new(store.clone(), config.offline.capacity, config.offline.ttl());
        let registry = ConnectionRegistry::new(offline.clone(), config.websocket.outbound_queue_size);
        Self {
            registry,
            presence: PresenceTracker::new(store.clone(), config.presence.ttl()),
            message_cache: MessageCache::new(store.clone(), &config.cache),
            unread: UnreadCounter::new(store, config.unread.ttl()),
            jobs: JobQueue::start(config.jobs.queue_size, config.jobs.workers),
            offline,
            users,
            messages,
            authenticator,
            config,
        }
    }
}
