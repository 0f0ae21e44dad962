//! SQLite-backed [`PersistenceStore`]

use async_trait::async_trait;
use sdk::errors::EngineError;
use std::sync::Arc;

use super::Database;
use crate::store::{
    CharacterState, Conversation, ExchangeRecord, MemoryCounts, MemoryItem, MemoryType,
    PersistenceStore, Result, Sender, User,
};

/// Store that delegates to the database repositories
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

fn persistence(err: anyhow::Error) -> EngineError {
    // `{:#}` keeps the context chain on one line
    EngineError::Persistence(format!("{:#}", err))
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn ensure_user(&self, username: &str) -> Result<User> {
        self.db
            .conversations()
            .ensure_user(username)
            .await
            .map_err(persistence)
    }

    async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation> {
        self.db
            .conversations()
            .create_conversation(user_id, title)
            .await
            .map_err(persistence)
    }

    async fn list_conversations(&self, user_id: &str, limit: i64) -> Result<Vec<Conversation>> {
        self.db
            .conversations()
            .list_conversations(user_id, limit)
            .await
            .map_err(persistence)
    }

    async fn save_exchange(
        &self,
        conversation_id: &str,
        sender: Sender,
        content: &str,
        message_type: &str,
        metadata: serde_json::Value,
    ) -> Result<ExchangeRecord> {
        self.db
            .conversations()
            .save_message(conversation_id, sender, content, message_type, metadata)
            .await
            .map_err(persistence)
    }

    async fn list_exchanges(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ExchangeRecord>> {
        self.db
            .conversations()
            .get_messages(conversation_id, limit)
            .await
            .map_err(persistence)
    }

    async fn save_memory_item(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
    ) -> Result<MemoryItem> {
        self.db
            .memories()
            .save(user_id, conversation_id, content, memory_type, importance)
            .await
            .map_err(persistence)
    }

    async fn get_memory_item(&self, id: &str) -> Result<Option<MemoryItem>> {
        self.db.memories().get(id).await.map_err(persistence)
    }

    async fn promote_memory_item(&self, id: &str, importance_floor: f64) -> Result<MemoryItem> {
        self.db
            .memories()
            .promote(id, importance_floor)
            .await
            .map_err(persistence)?
            .ok_or_else(|| EngineError::MemoryNotFound(id.to_string()))
    }

    async fn list_memories(
        &self,
        user_id: &str,
        memory_type: Option<MemoryType>,
        limit: i64,
    ) -> Result<Vec<MemoryItem>> {
        self.db
            .memories()
            .list(user_id, memory_type, limit)
            .await
            .map_err(persistence)
    }

    async fn memory_stats(&self, user_id: &str) -> Result<MemoryCounts> {
        self.db.memories().counts(user_id).await.map_err(persistence)
    }

    async fn save_character_state(&self, state: &CharacterState) -> Result<CharacterState> {
        self.db.characters().upsert(state).await.map_err(persistence)
    }

    async fn get_character_state(&self, user_id: &str) -> Result<Option<CharacterState>> {
        self.db.characters().get(user_id).await.map_err(persistence)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.db.pool())
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }
}
