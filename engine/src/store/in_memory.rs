//! Process-local store
//!
//! Mirrors the SQLite store's constraints (unknown users and conversations
//! are rejected) so tests written against it hold for both.

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    now_millis, CharacterState, Conversation, ExchangeRecord, MemoryCounts, MemoryItem,
    MemoryType, PersistenceStore, Result, Sender, User,
};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    conversations: HashMap<String, Conversation>,
    exchanges: HashMap<String, Vec<ExchangeRecord>>,
    memories: Vec<MemoryItem>,
    characters: HashMap<String, CharacterState>,
}

/// In-memory [`PersistenceStore`]
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn ensure_user(&self, username: &str) -> Result<User> {
        let mut inner = self.inner.write().await;

        if let Some(user) = inner.users.values().find(|u| u.username == username) {
            return Ok(user.clone());
        }

        let now = now_millis();
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: None,
            preferences: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation> {
        let mut inner = self.inner.write().await;

        if !inner.users.contains_key(user_id) {
            return Err(EngineError::Persistence(format!("Unknown user {}", user_id)));
        }

        let now = now_millis();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            metadata: serde_json::json!({ "created_by": "airi-system" }),
            created_at: now,
            updated_at: now,
        };
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn list_conversations(&self, user_id: &str, limit: i64) -> Result<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut conversations: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        conversations.truncate(limit);
        Ok(conversations)
    }

    async fn save_exchange(
        &self,
        conversation_id: &str,
        sender: Sender,
        content: &str,
        message_type: &str,
        metadata: serde_json::Value,
    ) -> Result<ExchangeRecord> {
        let mut inner = self.inner.write().await;
        let now = now_millis();

        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| {
                EngineError::Persistence(format!("Unknown conversation {}", conversation_id))
            })?;
        conversation.updated_at = now;

        let record = ExchangeRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender,
            content: content.to_string(),
            message_type: message_type.to_string(),
            metadata,
            created_at: now,
        };
        inner
            .exchanges
            .entry(conversation_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn list_exchanges(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ExchangeRecord>> {
        let inner = self.inner.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);

        Ok(inner
            .exchanges
            .get(conversation_id)
            .map(|records| records.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn save_memory_item(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
    ) -> Result<MemoryItem> {
        let mut inner = self.inner.write().await;

        if !inner.users.contains_key(user_id) {
            return Err(EngineError::Persistence(format!("Unknown user {}", user_id)));
        }
        if let Some(id) = conversation_id {
            if !inner.conversations.contains_key(id) {
                return Err(EngineError::Persistence(format!(
                    "Unknown conversation {}",
                    id
                )));
            }
        }

        let now = now_millis();
        let item = MemoryItem {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.map(str::to_string),
            memory_type,
            content: content.to_string(),
            importance_score: importance,
            created_at: now,
            accessed_at: now,
            access_count: 1,
        };
        inner.memories.push(item.clone());
        Ok(item)
    }

    async fn get_memory_item(&self, id: &str) -> Result<Option<MemoryItem>> {
        let inner = self.inner.read().await;
        Ok(inner.memories.iter().find(|m| m.id == id).cloned())
    }

    async fn promote_memory_item(&self, id: &str, importance_floor: f64) -> Result<MemoryItem> {
        let mut inner = self.inner.write().await;

        let item = inner
            .memories
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| EngineError::MemoryNotFound(id.to_string()))?;

        *item = item.promoted(importance_floor, now_millis());
        Ok(item.clone())
    }

    async fn list_memories(
        &self,
        user_id: &str,
        memory_type: Option<MemoryType>,
        limit: i64,
    ) -> Result<Vec<MemoryItem>> {
        let inner = self.inner.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut items: Vec<MemoryItem> = inner
            .memories
            .iter()
            .rev()
            .filter(|m| m.user_id == user_id)
            .filter(|m| memory_type.map_or(true, |t| m.memory_type == t))
            .cloned()
            .collect();
        // Stable sort keeps newest-inserted first among equal timestamps
        items.sort_by(|a, b| b.accessed_at.cmp(&a.accessed_at));
        items.truncate(limit);
        Ok(items)
    }

    async fn memory_stats(&self, user_id: &str) -> Result<MemoryCounts> {
        let inner = self.inner.read().await;

        let mut counts = MemoryCounts::default();
        for item in inner.memories.iter().filter(|m| m.user_id == user_id) {
            match item.memory_type {
                MemoryType::ShortTerm => counts.short_term += 1,
                MemoryType::LongTerm => counts.long_term += 1,
            }
        }
        Ok(counts)
    }

    async fn save_character_state(&self, state: &CharacterState) -> Result<CharacterState> {
        let mut inner = self.inner.write().await;

        if !inner.users.contains_key(&state.user_id) {
            return Err(EngineError::Persistence(format!(
                "Unknown user {}",
                state.user_id
            )));
        }

        let saved = CharacterState {
            updated_at: now_millis(),
            ..state.clone()
        };
        inner
            .characters
            .insert(saved.user_id.clone(), saved.clone());
        Ok(saved)
    }

    async fn get_character_state(&self, user_id: &str) -> Result<Option<CharacterState>> {
        Ok(self.inner.read().await.characters.get(user_id).cloned())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
