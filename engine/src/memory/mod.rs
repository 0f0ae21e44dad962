//! Memory Ledger
//!
//! Tracks short-term and long-term memory items per user on top of a
//! [`PersistenceStore`] and applies the promotion policy.
//!
//! # Accounting rules
//!
//! - New items are always `short_term` with an importance in `[0, 1]`
//! - The reported short-term count is capped at `short_term_ceiling`;
//!   nothing is evicted when the ceiling is reached
//! - Promotion is one-way and idempotent, see [`MemoryItem::promoted`](crate::store::MemoryItem::promoted)
//! - `total` is always `short_term + long_term` of the reported snapshot
//!
//! # Consistency
//!
//! Writes and promotions for one user hold that user's lock across the
//! change and the follow-up count, so the snapshot returned always includes
//! its own change and concurrent callers for the same user never
//! undercount. A user's lock is dropped from the map once nobody holds it.

use sdk::errors::EngineError;
use sdk::protocol::MemoryStats;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::MemoryConfig;
use crate::store::{MemoryCounts, MemoryType, PersistenceStore, Sender};

/// Maximum characters kept when summarizing an utterance into a memory
const SUMMARY_MAX_CHARS: usize = 200;

/// Memory counts for one user as reported to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub user_id: String,
    pub short_term_count: u64,
    pub long_term_count: u64,
}

impl MemorySnapshot {
    pub fn stats(&self) -> MemoryStats {
        MemoryStats::new(self.short_term_count, self.long_term_count)
    }
}

/// Per-user memory accounting
pub struct MemoryLedger {
    store: Arc<dyn PersistenceStore>,
    config: MemoryConfig,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryLedger {
    pub fn new(store: Arc<dyn PersistenceStore>, config: MemoryConfig) -> Self {
        Self {
            store,
            config,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Append a short-term memory item for `user_id`
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidInput`] if `importance` is outside `[0, 1]`
    /// - [`EngineError::Persistence`] if the store rejects the write
    pub async fn record_short_term(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        importance: f64,
    ) -> Result<MemorySnapshot, EngineError> {
        if !(0.0..=1.0).contains(&importance) {
            return Err(EngineError::InvalidInput(format!(
                "importance must be between 0.0 and 1.0, got {}",
                importance
            )));
        }

        let lock = self.user_lock(user_id).await;
        let result = async {
            let _guard = lock.lock().await;

            let item = self
                .store
                .save_memory_item(
                    user_id,
                    conversation_id,
                    content,
                    MemoryType::ShortTerm,
                    importance,
                )
                .await?;
            debug!("Recorded short-term memory {} for {}", item.id, user_id);

            let counts = self.store.memory_stats(user_id).await?;
            Ok::<_, EngineError>(self.snapshot_from(user_id, counts))
        }
        .await;
        self.release_lock(user_id, lock).await;
        result
    }

    /// Record one side of an exchange with the fixed importance for its sender
    pub async fn record_utterance(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        sender: Sender,
        text: &str,
    ) -> Result<MemorySnapshot, EngineError> {
        let importance = match sender {
            Sender::User => self.config.user_importance,
            Sender::Airi | Sender::System => self.config.reply_importance,
        };
        self.record_short_term(user_id, conversation_id, &summarize(sender, text), importance)
            .await
    }

    /// Promote a memory item to long-term
    ///
    /// # Errors
    ///
    /// [`EngineError::MemoryNotFound`] if no item has this id.
    pub async fn promote(&self, memory_id: &str) -> Result<MemorySnapshot, EngineError> {
        let user_id = self
            .store
            .get_memory_item(memory_id)
            .await?
            .ok_or_else(|| EngineError::MemoryNotFound(memory_id.to_string()))?
            .user_id;

        let lock = self.user_lock(&user_id).await;
        let result = async {
            let _guard = lock.lock().await;

            let item = self
                .store
                .promote_memory_item(memory_id, self.config.promotion_floor)
                .await?;
            debug!(
                "Memory {} is long-term (importance {:.2})",
                item.id, item.importance_score
            );

            let counts = self.store.memory_stats(&user_id).await?;
            Ok::<_, EngineError>(self.snapshot_from(&user_id, counts))
        }
        .await;
        self.release_lock(&user_id, lock).await;
        result
    }

    /// Current counts for `user_id`
    pub async fn snapshot(&self, user_id: &str) -> Result<MemorySnapshot, EngineError> {
        let lock = self.user_lock(user_id).await;
        let result = async {
            let _guard = lock.lock().await;
            let counts = self.store.memory_stats(user_id).await?;
            Ok::<_, EngineError>(self.snapshot_from(user_id, counts))
        }
        .await;
        self.release_lock(user_id, lock).await;
        result
    }

    /// `{ short_term, long_term, total }` for `user_id`
    pub async fn stats(&self, user_id: &str) -> Result<MemoryStats, EngineError> {
        Ok(self.snapshot(user_id).await?.stats())
    }

    fn snapshot_from(&self, user_id: &str, counts: MemoryCounts) -> MemorySnapshot {
        MemorySnapshot {
            user_id: user_id.to_string(),
            short_term_count: counts.short_term.min(self.config.short_term_ceiling),
            long_term_count: counts.long_term,
        }
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }

    /// Give back a lock from [`Self::user_lock`], forgetting it when unused
    async fn release_lock(&self, user_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.user_locks.lock().await;
        drop(lock);
        // The map's own reference is the only one left
        if locks.get(user_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(user_id);
        }
    }

    #[cfg(test)]
    async fn tracked_users(&self) -> usize {
        self.user_locks.lock().await.len()
    }
}

/// One-line memory text for an utterance, truncated on a char boundary
fn summarize(sender: Sender, text: &str) -> String {
    let label = match sender {
        Sender::User => "User said",
        Sender::Airi => "AIRI replied",
        Sender::System => "System noted",
    };
    let trimmed = text.trim();
    let mut summary: String = trimmed.chars().take(SUMMARY_MAX_CHARS).collect();
    if trimmed.chars().count() > SUMMARY_MAX_CHARS {
        summary.push_str("...");
    }
    format!("{}: {}", label, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    async fn ledger_with_user(config: MemoryConfig) -> (MemoryLedger, Arc<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::new());
        let user = store.ensure_user("guest").await.unwrap();
        let ledger = MemoryLedger::new(store.clone(), config);
        (ledger, store, user.id)
    }

    #[tokio::test]
    async fn test_record_short_term_counts() {
        let (ledger, _, user) = ledger_with_user(MemoryConfig::default()).await;

        let first = ledger
            .record_short_term(&user, None, "likes tea", 0.6)
            .await
            .unwrap();
        assert_eq!(first.short_term_count, 1);
        assert_eq!(first.long_term_count, 0);

        let second = ledger
            .record_short_term(&user, None, "has a cat", 0.7)
            .await
            .unwrap();
        assert_eq!(second.short_term_count, 2);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_importance() {
        let (ledger, _, user) = ledger_with_user(MemoryConfig::default()).await;

        for bad in [-0.1, 1.01, f64::NAN] {
            let err = ledger
                .record_short_term(&user, None, "x", bad)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)));
        }
        assert_eq!(ledger.stats(&user).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_ceiling_caps_reported_count_without_eviction() {
        let config = MemoryConfig {
            short_term_ceiling: 3,
            ..MemoryConfig::default()
        };
        let (ledger, store, user) = ledger_with_user(config).await;

        for i in 0..5 {
            ledger
                .record_short_term(&user, None, &format!("fact {}", i), 0.5)
                .await
                .unwrap();
        }

        let snapshot = ledger.snapshot(&user).await.unwrap();
        assert_eq!(snapshot.short_term_count, 3);

        // Every item is still stored
        let counts = store.memory_stats(&user).await.unwrap();
        assert_eq!(counts.short_term, 5);
    }

    #[tokio::test]
    async fn test_promote_is_idempotent() {
        let (ledger, store, user) = ledger_with_user(MemoryConfig::default()).await;
        ledger
            .record_short_term(&user, None, "birthday is in May", 0.6)
            .await
            .unwrap();
        let item = store
            .list_memories(&user, None, 1)
            .await
            .unwrap()
            .remove(0);

        let once = ledger.promote(&item.id).await.unwrap();
        let twice = ledger.promote(&item.id).await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.short_term_count, 0);
        assert_eq!(twice.long_term_count, 1);

        let stored = store
            .list_memories(&user, Some(MemoryType::LongTerm), 1)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(stored.importance_score, 0.8);
    }

    #[tokio::test]
    async fn test_promote_unknown_id() {
        let (ledger, _, _) = ledger_with_user(MemoryConfig::default()).await;
        let err = ledger.promote("no-such-memory").await.unwrap_err();
        assert!(matches!(err, EngineError::MemoryNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_records_do_not_undercount() {
        let (ledger, _, user) = ledger_with_user(MemoryConfig::default()).await;
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = Arc::clone(&ledger);
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .record_short_term(&user, None, &format!("fact {}", i), 0.5)
                    .await
                    .unwrap()
                    .short_term_count
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();

        // Each write observed a distinct count: no two writes interleaved
        assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_concurrent_records_and_promotions_agree() {
        let (ledger, store, user) = ledger_with_user(MemoryConfig::default()).await;
        let ledger = Arc::new(ledger);

        let mut ids = Vec::new();
        for i in 0..10 {
            let item = store
                .save_memory_item(&user, None, &format!("seed {}", i), MemoryType::ShortTerm, 0.5)
                .await
                .unwrap();
            ids.push(item.id);
        }

        let mut handles = Vec::new();
        for (i, id) in ids.into_iter().enumerate() {
            let promoter = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                promoter.promote(&id).await.unwrap()
            }));
            let recorder = Arc::clone(&ledger);
            let user = user.clone();
            handles.push(tokio::spawn(async move {
                recorder
                    .record_short_term(&user, None, &format!("fact {}", i), 0.5)
                    .await
                    .unwrap()
            }));
        }

        // Promotions move items between tiers; records add one each
        for handle in handles {
            let snapshot = handle.await.unwrap();
            let total = snapshot.short_term_count + snapshot.long_term_count;
            assert!((10..=20).contains(&total), "{:?}", snapshot);
            assert!(snapshot.long_term_count <= 10, "{:?}", snapshot);
        }

        let settled = ledger.snapshot(&user).await.unwrap();
        assert_eq!(settled.short_term_count, 10);
        assert_eq!(settled.long_term_count, 10);
        assert_eq!(ledger.tracked_users().await, 0);
    }

    #[tokio::test]
    async fn test_promote_locks_the_owner() {
        let (ledger, store, user) = ledger_with_user(MemoryConfig::default()).await;
        let item = store
            .save_memory_item(&user, None, "favourite colour is green", MemoryType::ShortTerm, 0.6)
            .await
            .unwrap();

        let lock = ledger.user_lock(&user).await;
        let guard = lock.lock().await;

        // Promotion waits while the owner's lock is held
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ledger.promote(&item.id),
        )
        .await;
        assert!(pending.is_err());
        let stored = store.get_memory_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.memory_type, MemoryType::ShortTerm);

        drop(guard);
        ledger.release_lock(&user, lock).await;

        let snapshot = ledger.promote(&item.id).await.unwrap();
        assert_eq!(snapshot.long_term_count, 1);
    }

    #[tokio::test]
    async fn test_idle_user_locks_are_forgotten() {
        let (ledger, _, user) = ledger_with_user(MemoryConfig::default()).await;

        ledger
            .record_short_term(&user, None, "likes tea", 0.6)
            .await
            .unwrap();
        ledger.snapshot(&user).await.unwrap();
        ledger.snapshot("someone-else").await.unwrap();
        assert!(ledger.promote("missing").await.is_err());

        assert_eq!(ledger.tracked_users().await, 0);
    }

    #[tokio::test]
    async fn test_record_utterance_uses_sender_importance() {
        let (ledger, store, user) = ledger_with_user(MemoryConfig::default()).await;

        ledger
            .record_utterance(&user, None, Sender::User, "Hello")
            .await
            .unwrap();
        ledger
            .record_utterance(&user, None, Sender::Airi, "Hi there")
            .await
            .unwrap();

        let items = store.list_memories(&user, None, 10).await.unwrap();
        let mut scores: Vec<f64> = items.iter().map(|m| m.importance_score).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(scores, vec![0.6, 0.7]);
        assert!(items.iter().any(|m| m.content == "User said: Hello"));
    }

    #[test]
    fn test_summarize_truncates_on_char_boundary() {
        let long = "é".repeat(SUMMARY_MAX_CHARS + 10);
        let summary = summarize(Sender::User, &long);
        assert!(summary.ends_with("..."));
        assert_eq!(
            summary.chars().count(),
            "User said: ".len() + SUMMARY_MAX_CHARS + 3
        );
    }
}
