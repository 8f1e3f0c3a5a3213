use tracing::{debug, info, warn};

use crate::domain::ServerFrame;
use crate::server::RelayContext;

impl RelayContext {
    /// 重连补推 / Replay backlog to a freshly admitted connection
    ///
    /// Parked offline messages go first, newest first, and the queue is
    /// cleared only after every entry made it onto the socket queue; an
    /// interrupted replay redelivers next time instead of losing messages.
    /// Durable unread history follows as ordinary chat frames, oldest first.
    /// The two overlap on purpose and clients de-duplicate by message id.
    pub async fn replay_backlog(&self, user_id: u64) {
        let drain_limit = self.config.websocket.drain_limit;
        match self.offline.drain(user_id, drain_limit).await {
            Ok(parked) if !parked.is_empty() => {
                let total = parked.len();
                let mut replayed = 0usize;
                for message in &parked {
                    if !self.registry.try_send_live(user_id, message.to_frame()) {
                        break;
                    }
                    replayed += 1;
                }
                if replayed == total {
                    match self.offline.clear(user_id).await {
                        Ok(()) => info!("📦 replayed {total} offline messages to user {user_id}"),
                        Err(err) => warn!(
                            "offline queue clear failed for user {user_id}, entries will redeliver: {err:#}"
                        ),
                    }
                } else {
                    debug!("offline replay stopped at {replayed}/{total} for user {user_id}");
                }
            }
            Ok(_) => {}
            Err(err) => warn!("offline drain failed for user {user_id}: {err:#}"),
        }

        match self.messages.unread_for(user_id).await {
            Ok(unread) => {
                for message in &unread {
                    if !self.registry.try_send_live(user_id, ServerFrame::chat(message)) {
                        debug!("unread backlog push stopped for user {user_id}");
                        break;
                    }
                }
            }
            Err(err) => warn!("unread backlog fetch failed for user {user_id}: {err:#}"),
        }
    }
}
