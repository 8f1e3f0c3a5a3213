use tracing::{debug, warn};

use crate::domain::{Message, NewMessage, ServerFrame};
use crate::error::RelayError;
use crate::server::{DeliveryOutcome, RelayContext};
use crate::store::message_cache::sort_summaries;
use crate::store::CachedConversation;

/// 历史分页的默认与上限 / History paging default and ceiling
const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

impl RelayContext {
    /// 发送一条私聊消息 / Submit a 1:1 message
    ///
    /// Persists first; everything else (cache append, unread bump, summary
    /// upserts) is best-effort bookkeeping dispatched to the job queue, and
    /// the frame is then delivered live or parked offline.
    pub async fn send_message(
        &self,
        sender_id: u64,
        receiver_id: u64,
        content: &str,
    ) -> Result<(Message, DeliveryOutcome), RelayError> {
        if sender_id == receiver_id {
            return Err(RelayError::validation("cannot message yourself"));
        }
        if content.trim().is_empty() {
            return Err(RelayError::validation("message content must not be empty"));
        }
        let receiver = self
            .users
            .get_by_id(receiver_id)
            .await?
            .ok_or_else(|| RelayError::not_found("receiver"))?;

        let message = self
            .messages
            .create(NewMessage::text(sender_id, receiver_id, content))
            .await?;

        let cache = self.message_cache.clone();
        let cached = message.clone();
        self.jobs.dispatch("message-cache append", async move {
            cache.append_message(&cached).await
        });

        let cache = self.message_cache.clone();
        let unread = self.unread.clone();
        let users = self.users.clone();
        let messages_repo = self.messages.clone();
        let preview = message.clone();
        let receiver_name = receiver.username.clone();
        self.jobs.dispatch("unread and summaries", async move {
            unread.increment(receiver_id).await?;
            // the sender's own entry has nothing unread in it
            cache
                .upsert_conversation(
                    sender_id,
                    receiver_id,
                    &receiver_name,
                    &preview.content,
                    preview.created_at,
                    0,
                )
                .await?;
            let sender_name = users
                .get_by_id(sender_id)
                .await?
                .map(|u| u.username)
                .unwrap_or_default();
            // 摘要里的未读数只统计这个对端 / The summary unread covers this counterpart only
            let from_sender = messages_repo
                .count_unread_between(receiver_id, sender_id)
                .await?;
            cache
                .upsert_conversation(
                    receiver_id,
                    sender_id,
                    &sender_name,
                    &preview.content,
                    preview.created_at,
                    from_sender,
                )
                .await?;
            Ok(())
        });

        let outcome = self
            .registry
            .deliver(receiver_id, ServerFrame::chat(&message))
            .await;
        Ok((message, outcome))
    }

    /// 双向会话历史，第一页走缓存 / Conversation history; page one is served cache-aside
    ///
    /// Viewing any page also schedules marking the conversation read on the
    /// durable side.
    pub async fn conversation_history(
        &self,
        user_id: u64,
        other_id: u64,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Message>, RelayError> {
        let page = page.max(1);
        let page_size = match page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let messages = if page == 1 && page_size <= self.message_cache.message_window() {
            match self.message_cache.read_messages(user_id, other_id).await {
                Ok(Some(window)) => window.into_iter().take(page_size).collect(),
                Ok(None) => {
                    let fetched = self
                        .messages
                        .conversation_page(user_id, other_id, page_size, 0)
                        .await?;
                    let cache = self.message_cache.clone();
                    let snapshot = fetched.clone();
                    self.jobs.dispatch("message-cache populate", async move {
                        cache.populate(user_id, other_id, &snapshot).await
                    });
                    fetched
                }
                Err(err) => {
                    // cache trouble never fails a read, fall through to durable
                    warn!("message cache read failed for {user_id}:{other_id}: {err:#}");
                    self.messages
                        .conversation_page(user_id, other_id, page_size, 0)
                        .await?
                }
            }
        } else {
            self.messages
                .conversation_page(user_id, other_id, page_size, (page - 1) * page_size)
                .await?
        };

        let messages_repo = self.messages.clone();
        self.jobs.dispatch("mark conversation read", async move {
            messages_repo.mark_conversation_read(user_id, other_id).await?;
            Ok(())
        });

        Ok(messages)
    }

    /// 单条已读：仅收件人可标记 / Mark one message read; recipients only
    pub async fn mark_read(&self, message_id: u64, user_id: u64) -> Result<(), RelayError> {
        let message = self
            .messages
            .get_by_id(message_id)
            .await?
            .ok_or_else(|| RelayError::not_found("message"))?;
        if message.receiver_id != user_id {
            return Err(RelayError::permission_denied(
                "only the recipient can mark a message read",
            ));
        }
        if message.is_read {
            return Ok(());
        }
        self.messages.mark_read(message_id).await?;
        if let Err(err) = self.unread.decrement(user_id).await {
            warn!("unread decrement failed for user {user_id}: {err:#}");
        }
        Ok(())
    }

    /// 整个会话已读并重新校准计数 / Mark a whole conversation read and resync the counter
    pub async fn mark_conversation_read(
        &self,
        user_id: u64,
        other_id: u64,
    ) -> Result<u64, RelayError> {
        let updated = self
            .messages
            .mark_conversation_read(user_id, other_id)
            .await?;
        let remaining = self.messages.count_unread(user_id).await?;
        if let Err(err) = self.unread.set(user_id, remaining).await {
            warn!("unread resync failed for user {user_id}: {err:#}");
        }
        Ok(updated)
    }

    /// 全部已读 / Mark everything read
    pub async fn mark_all_read(&self, user_id: u64) -> Result<u64, RelayError> {
        let updated = self.messages.mark_all_read(user_id).await?;
        if let Err(err) = self.unread.reset(user_id).await {
            warn!("unread reset failed for user {user_id}: {err:#}");
        }
        Ok(updated)
    }

    /// 未读总数：计数器优先，缺失则回源并回填
    /// Total unread: counter first, recompute from durable and backfill on absence
    pub async fn unread_count(&self, user_id: u64) -> Result<i64, RelayError> {
        match self.unread.get(user_id).await {
            Ok(Some(count)) => return Ok(count),
            Ok(None) => {}
            Err(err) => warn!("unread counter read failed for user {user_id}: {err:#}"),
        }
        let count = self.messages.count_unread(user_id).await?;
        if let Err(err) = self.unread.set(user_id, count).await {
            warn!("unread backfill failed for user {user_id}: {err:#}");
        }
        Ok(count)
    }

    /// 最近会话列表，缓存未命中时从持久层重建
    /// Recent conversation list, rebuilt from durable history on a cache miss
    pub async fn conversations(
        &self,
        user_id: u64,
        limit: usize,
    ) -> Result<Vec<CachedConversation>, RelayError> {
        let cap = self.config.cache.max_conversations;
        let limit = match limit {
            0 => cap,
            n => n.min(cap),
        };

        match self.message_cache.read_conversations(user_id).await {
            Ok(Some(cached)) if !cached.is_empty() => {
                return Ok(cached.into_iter().take(limit).collect());
            }
            Ok(_) => {}
            Err(err) => warn!("conversation cache read failed for user {user_id}: {err:#}"),
        }

        // scan wider than the limit so dense chatter with one counterpart
        // does not crowd out the rest
        let recent = self.messages.recent_involving(user_id, limit * 2).await?;
        let mut summaries: Vec<CachedConversation> = Vec::new();
        for message in recent {
            let counterpart = if message.sender_id == user_id {
                message.receiver_id
            } else {
                message.sender_id
            };
            if summaries.iter().any(|s| s.user_id == counterpart) {
                continue;
            }
            let username = self
                .users
                .get_by_id(counterpart)
                .await?
                .map(|u| u.username)
                .unwrap_or_default();
            let unread_count = match self.messages.count_unread_between(user_id, counterpart).await {
                Ok(count) => count,
                Err(err) => {
                    debug!("unread lookup failed for {user_id}:{counterpart}: {err:#}");
                    0
                }
            };
            summaries.push(CachedConversation {
                user_id: counterpart,
                username,
                last_message: message.content,
                last_time: message.created_at,
                unread_count,
            });
        }
        // 返回顺序必须和缓存里的一致 / The return must be ordered the way the cache is
        sort_summaries(&mut summaries);
        summaries.truncate(limit);

        let cache = self.message_cache.clone();
        let snapshot = summaries.clone();
        self.jobs.dispatch("conversation-cache populate", async move {
            cache.populate_conversations(user_id, &snapshot).await
        });

        Ok(summaries)
    }

    /// 删除消息：仅发送者可删 / Delete a message; senders only
    pub async fn delete_message(&self, message_id: u64, user_id: u64) -> Result<(), RelayError> {
        let message = self
            .messages
            .get_by_id(message_id)
            .await?
            .ok_or_else(|| RelayError::not_found("message"))?;
        if message.sender_id != user_id {
            return Err(RelayError::permission_denied(
                "only the sender can delete a message",
            ));
        }
        self.messages.delete(message_id).await?;

        // drop the stale cache window and any parked offline copy
        let cache = self.message_cache.clone();
        let offline = self.offline.clone();
        let (sender_id, receiver_id) = (message.sender_id, message.receiver_id);
        self.jobs.dispatch("purge deleted message", async move {
            cache.clear_messages(sender_id, receiver_id).await?;
            offline.remove(receiver_id, message_id).await?;
            Ok(())
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::domain::KIND_TEXT;
    use crate::repo::{MemoryMessageRepository, MemoryUserRepository, MessageRepository};
    use crate::service::HmacAuthenticator;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn context() -> RelayContext {
        RelayContext::new(
            RelayConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryUserRepository::with_users(&[
                (1, "alice"),
                (2, "bob"),
                (3, "carol"),
            ])),
            Arc::new(MemoryMessageRepository::new()),
            Arc::new(HmacAuthenticator::new("test-secret")),
        )
    }

    #[tokio::test]
    async fn test_send_message_validation() {
        let ctx = context();
        assert!(matches!(
            ctx.send_message(1, 1, "hi").await,
            Err(RelayError::Validation { .. })
        ));
        assert!(matches!(
            ctx.send_message(1, 2, "   ").await,
            Err(RelayError::Validation { .. })
        ));
        assert!(matches!(
            ctx.send_message(1, 404, "hi").await,
            Err(RelayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_to_offline_user_parks_and_counts() {
        let ctx = context();
        let (message, outcome) = ctx.send_message(1, 2, "hello bob").await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Queued);
        assert_eq!(message.sender_id, 1);
        assert_eq!(ctx.offline.count(2).await.unwrap(), 1);

        // unread bump and summary upserts run on the job queue
        let mut counted = false;
        for _ in 0..100 {
            if ctx.unread.get(2).await.unwrap() == Some(1) {
                counted = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(counted, "unread counter never reached 1");

        let mut summaries = None;
        for _ in 0..100 {
            if let Some(list) = ctx.message_cache.read_conversations(2).await.unwrap() {
                summaries = Some(list);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let summaries = summaries.expect("receiver summary never cached");
        assert_eq!(summaries[0].user_id, 1);
        assert_eq!(summaries[0].username, "alice");
        assert_eq!(summaries[0].unread_count, 1);
        assert_eq!(summaries[0].last_message, "hello bob");
    }

    #[tokio::test]
    async fn test_summary_unread_counts_one_counterpart() {
        let ctx = context();
        ctx.send_message(3, 2, "from carol").await.unwrap();
        ctx.send_message(1, 2, "from alice").await.unwrap();

        let mut summaries = None;
        for _ in 0..100 {
            match ctx.message_cache.read_conversations(2).await.unwrap() {
                Some(list) if list.len() == 2 => {
                    summaries = Some(list);
                    break;
                }
                _ => sleep(Duration::from_millis(10)).await,
            }
        }
        let summaries = summaries.expect("both summaries never cached");

        // two unread in total, but each entry counts only its own counterpart
        let from_alice = summaries.iter().find(|s| s.user_id == 1).unwrap();
        let from_carol = summaries.iter().find(|s| s.user_id == 3).unwrap();
        assert_eq!(from_alice.unread_count, 1);
        assert_eq!(from_carol.unread_count, 1);
        assert_eq!(ctx.unread_count(2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_live_delivery_reaches_socket_queue() {
        let ctx = context();
        let (_handle, mut rx) = ctx.registry.admit(2);

        let (message, outcome) = ctx.send_message(1, 2, "ping").await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::LiveSent);
        match rx.recv().await {
            Some(ServerFrame::Chat { from, to, msg_id, .. }) => {
                assert_eq!(from, 1);
                assert_eq!(to, 2);
                assert_eq!(msg_id, message.id);
            }
            other => panic!("expected chat frame, got {:?}", other),
        }
        assert_eq!(ctx.offline.count(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unread_count_recomputes_from_durable() {
        let ctx = context();
        ctx.messages.create(NewMessage::text(1, 2, "one")).await.unwrap();
        ctx.messages.create(NewMessage::text(3, 2, "two")).await.unwrap();

        // counter cold: falls back to the durable count and backfills
        assert_eq!(ctx.unread_count(2).await.unwrap(), 2);
        assert_eq!(ctx.unread.get(2).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_mark_read_recipient_only() {
        let ctx = context();
        let (message, _) = ctx.send_message(1, 2, "hello").await.unwrap();
        for _ in 0..100 {
            if ctx.unread.get(2).await.unwrap().is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(
            ctx.mark_read(message.id, 3).await,
            Err(RelayError::PermissionDenied { .. })
        ));
        assert!(matches!(
            ctx.mark_read(404, 2).await,
            Err(RelayError::NotFound { .. })
        ));

        ctx.mark_read(message.id, 2).await.unwrap();
        let stored = ctx.messages.get_by_id(message.id).await.unwrap().unwrap();
        assert!(stored.is_read);
        // decremented to zero, which is key absence
        assert_eq!(ctx.unread.get(2).await.unwrap(), None);

        // acking twice is a no-op
        ctx.mark_read(message.id, 2).await.unwrap();
        assert_eq!(ctx.unread.get(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_history_first_page_populates_cache() {
        let ctx = context();
        for i in 0..5 {
            ctx.messages
                .create(NewMessage::text(1, 2, format!("m{i}")))
                .await
                .unwrap();
        }

        let page = ctx.conversation_history(2, 1, 1, 10).await.unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].content, "m4");

        let mut cached = None;
        for _ in 0..100 {
            if let Some(window) = ctx.message_cache.read_messages(1, 2).await.unwrap() {
                cached = Some(window);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cached.expect("window never cached").len(), 5);

        // viewing page one marks the conversation read durably
        let mut read = false;
        for _ in 0..100 {
            if ctx.messages.count_unread_between(2, 1).await.unwrap() == 0 {
                read = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(read, "mark-conversation-read job never ran");
    }

    #[tokio::test]
    async fn test_history_deep_pages_go_durable() {
        let ctx = context();
        for i in 0..7 {
            ctx.messages
                .create(NewMessage::text(1, 2, format!("m{i}")))
                .await
                .unwrap();
        }

        let second = ctx.conversation_history(2, 1, 2, 3).await.unwrap();
        assert_eq!(second.len(), 3);
        // newest first overall, so page two starts after the top three
        assert_eq!(second[0].content, "m3");
        assert_eq!(second[2].content, "m1");
    }

    #[tokio::test]
    async fn test_history_deep_pages_also_mark_read() {
        let ctx = context();
        for i in 0..5 {
            ctx.messages
                .create(NewMessage::text(1, 2, format!("m{i}")))
                .await
                .unwrap();
        }
        assert_eq!(ctx.messages.count_unread_between(2, 1).await.unwrap(), 5);

        // a page-two view, not just page one, counts as reading the thread
        let second = ctx.conversation_history(2, 1, 2, 2).await.unwrap();
        assert_eq!(second.len(), 2);

        let mut read = false;
        for _ in 0..100 {
            if ctx.messages.count_unread_between(2, 1).await.unwrap() == 0 {
                read = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(read, "page-two view never marked the conversation read");
    }

    #[tokio::test]
    async fn test_mark_conversation_read_resyncs_counter() {
        let ctx = context();
        ctx.messages.create(NewMessage::text(1, 2, "a")).await.unwrap();
        ctx.messages.create(NewMessage::text(3, 2, "b")).await.unwrap();
        ctx.unread.set(2, 2).await.unwrap();

        let updated = ctx.mark_conversation_read(2, 1).await.unwrap();
        assert_eq!(updated, 1);
        // the message from carol is still unread
        assert_eq!(ctx.unread.get(2).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_mark_all_read_resets_counter() {
        let ctx = context();
        ctx.messages.create(NewMessage::text(1, 2, "a")).await.unwrap();
        ctx.messages.create(NewMessage::text(3, 2, "b")).await.unwrap();
        ctx.unread.set(2, 2).await.unwrap();

        let updated = ctx.mark_all_read(2).await.unwrap();
        assert_eq!(updated, 2);
        assert_eq!(ctx.unread.get(2).await.unwrap(), None);
        assert_eq!(ctx.messages.count_unread(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conversations_rebuilt_from_history() {
        let ctx = context();
        ctx.messages.create(NewMessage::text(2, 1, "from bob")).await.unwrap();
        ctx.messages.create(NewMessage::text(3, 1, "from carol")).await.unwrap();
        ctx.messages.create(NewMessage::text(3, 1, "again")).await.unwrap();

        let list = ctx.conversations(1, 10).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].user_id, 3);
        assert_eq!(list[0].username, "carol");
        assert_eq!(list[0].last_message, "again");
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(list[1].user_id, 2);
        assert_eq!(list[1].unread_count, 1);
    }

    /// 固定扫描结果的只读消息仓储 / A read-only message repository serving a canned scan
    struct CannedHistory {
        recent: Vec<Message>,
    }

    #[async_trait::async_trait]
    impl MessageRepository for CannedHistory {
        async fn create(&self, _draft: NewMessage) -> anyhow::Result<Message> {
            anyhow::bail!("read-only")
        }
        async fn get_by_id(&self, _id: u64) -> anyhow::Result<Option<Message>> {
            Ok(None)
        }
        async fn conversation_page(
            &self,
            _user_a: u64,
            _user_b: u64,
            _limit: usize,
            _offset: usize,
        ) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn unread_for(&self, _receiver: u64) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn mark_read(&self, _id: u64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn mark_conversation_read(&self, _receiver: u64, _sender: u64) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn mark_all_read(&self, _receiver: u64) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn count_unread(&self, _receiver: u64) -> anyhow::Result<i64> {
            Ok(0)
        }
        async fn count_unread_between(&self, _receiver: u64, _sender: u64) -> anyhow::Result<i64> {
            Ok(0)
        }
        async fn recent_involving(&self, _user: u64, _limit: usize) -> anyhow::Result<Vec<Message>> {
            Ok(self.recent.clone())
        }
        async fn delete(&self, _id: u64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rebuilt_conversations_share_the_cache_order() {
        fn stamped(id: u64, sender_id: u64, at: chrono::DateTime<Utc>) -> Message {
            Message {
                id,
                sender_id,
                receiver_id: 9,
                content: format!("m{id}"),
                kind: KIND_TEXT.to_string(),
                is_read: false,
                created_at: at,
                updated_at: at,
            }
        }

        // two counterparts share the same last_time; the repository scan puts
        // the higher message id first, the cache orders ties by counterpart id
        let same = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let canned = CannedHistory {
            recent: vec![stamped(12, 5, same), stamped(11, 3, same)],
        };
        let ctx = RelayContext::new(
            RelayConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryUserRepository::with_users(&[(3, "carol"), (5, "eve")])),
            Arc::new(canned),
            Arc::new(HmacAuthenticator::new("test-secret")),
        );

        let list = ctx.conversations(9, 10).await.unwrap();
        let ids: Vec<u64> = list.iter().map(|s| s.user_id).collect();
        assert_eq!(ids, vec![3, 5]);

        // the populated copy must agree with what the rebuild returned
        let mut cached = None;
        for _ in 0..100 {
            if let Some(entries) = ctx.message_cache.read_conversations(9).await.unwrap() {
                cached = Some(entries);
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cached.expect("summaries never cached"), list);
    }

    #[tokio::test]
    async fn test_delete_message_sender_only() {
        let ctx = context();
        let (message, _) = ctx.send_message(1, 2, "oops").await.unwrap();
        assert_eq!(ctx.offline.count(2).await.unwrap(), 1);

        assert!(matches!(
            ctx.delete_message(message.id, 2).await,
            Err(RelayError::PermissionDenied { .. })
        ));
        ctx.delete_message(message.id, 1).await.unwrap();
        assert!(ctx.messages.get_by_id(message.id).await.unwrap().is_none());

        // the purge job also removes the parked offline copy
        let mut purged = false;
        for _ in 0..100 {
            if ctx.offline.count(2).await.unwrap() == 0 {
                purged = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(purged, "offline copy never purged");
    }
}
