//! Persistence store abstraction
//!
//! The conversation exchange and the memory ledger never talk to a database
//! directly. They go through [`PersistenceStore`], which has two
//! implementations:
//!
//! - [`InMemoryStore`]: process-local maps, used by tests and `serve --ephemeral`
//! - [`crate::db::SqliteStore`]: SQLite via sqlx, the default for `serve`
//!
//! All records carry Unix-millisecond timestamps.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};

pub mod in_memory;

pub use in_memory::InMemoryStore;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Who authored an exchange record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Airi,
    System,
}

impl Sender {
    pub fn as_str(&self) -> &str {
        match self {
            Sender::User => "user",
            Sender::Airi => "airi",
            Sender::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Sender::User),
            "airi" => Ok(Sender::Airi),
            "system" => Ok(Sender::System),
            other => Err(EngineError::Persistence(format!(
                "Unknown sender '{}'",
                other
            ))),
        }
    }
}

/// Memory tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    ShortTerm,
    LongTerm,
}

impl MemoryType {
    pub fn as_str(&self) -> &str {
        match self {
            MemoryType::ShortTerm => "short_term",
            MemoryType::LongTerm => "long_term",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "short_term" => Ok(MemoryType::ShortTerm),
            "long_term" => Ok(MemoryType::LongTerm),
            other => Err(EngineError::Persistence(format!(
                "Unknown memory type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub preferences: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One persisted side of an exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    pub message_type: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub memory_type: MemoryType,
    pub content: String,
    pub importance_score: f64,
    pub created_at: i64,
    pub accessed_at: i64,
    pub access_count: i64,
}

impl MemoryItem {
    /// Apply promotion to a copy of this item.
    ///
    /// Long-term items come back unchanged. Short-term items become
    /// long-term, their score is raised to at least `floor` and
    /// `accessed_at` is set to `now`.
    pub fn promoted(&self, floor: f64, now: i64) -> MemoryItem {
        if self.memory_type == MemoryType::LongTerm {
            return self.clone();
        }
        MemoryItem {
            memory_type: MemoryType::LongTerm,
            importance_score: self.importance_score.max(floor),
            accessed_at: now,
            ..self.clone()
        }
    }
}

/// Raw per-tier counts for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryCounts {
    pub short_term: u64,
    pub long_term: u64,
}

/// Character presentation settings for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub user_id: String,
    pub character_name: String,
    pub personality: serde_json::Value,
    pub current_mood: String,
    pub voice_settings: serde_json::Value,
    pub appearance_settings: serde_json::Value,
    pub updated_at: i64,
}

impl CharacterState {
    /// Neutral starting state for a character
    pub fn new(user_id: impl Into<String>, character_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            character_name: character_name.into(),
            personality: serde_json::json!({}),
            current_mood: "neutral".to_string(),
            voice_settings: serde_json::json!({}),
            appearance_settings: serde_json::json!({}),
            updated_at: now_millis(),
        }
    }
}

/// Operations the core needs from persistence
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Return the user with this username, creating it if needed.
    async fn ensure_user(&self, username: &str) -> Result<User>;

    async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation>;

    /// A user's conversations, most recently updated first.
    async fn list_conversations(&self, user_id: &str, limit: i64) -> Result<Vec<Conversation>>;

    /// Append an exchange record and bump the conversation's `updated_at`.
    async fn save_exchange(
        &self,
        conversation_id: &str,
        sender: Sender,
        content: &str,
        message_type: &str,
        metadata: serde_json::Value,
    ) -> Result<ExchangeRecord>;

    /// Oldest first.
    async fn list_exchanges(&self, conversation_id: &str, limit: i64)
        -> Result<Vec<ExchangeRecord>>;

    async fn save_memory_item(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
    ) -> Result<MemoryItem>;

    async fn get_memory_item(&self, id: &str) -> Result<Option<MemoryItem>>;

    /// One-way short-term to long-term transition, see [`MemoryItem::promoted`].
    ///
    /// Fails with [`EngineError::MemoryNotFound`] for an unknown id.
    async fn promote_memory_item(&self, id: &str, importance_floor: f64) -> Result<MemoryItem>;

    /// Most recently accessed first.
    async fn list_memories(
        &self,
        user_id: &str,
        memory_type: Option<MemoryType>,
        limit: i64,
    ) -> Result<Vec<MemoryItem>>;

    async fn memory_stats(&self, user_id: &str) -> Result<MemoryCounts>;

    /// Insert or replace the state for `state.user_id`.
    async fn save_character_state(&self, state: &CharacterState) -> Result<CharacterState>;

    async fn get_character_state(&self, user_id: &str) -> Result<Option<CharacterState>>;

    async fn health_check(&self) -> Result<()>;
}

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(memory_type: MemoryType, score: f64) -> MemoryItem {
        MemoryItem {
            id: "m1".into(),
            user_id: "u1".into(),
            conversation_id: None,
            memory_type,
            content: "likes tea".into(),
            importance_score: score,
            created_at: 10,
            accessed_at: 10,
            access_count: 1,
        }
    }

    #[test]
    fn test_promotion_raises_to_floor() {
        let promoted = item(MemoryType::ShortTerm, 0.6).promoted(0.8, 99);
        assert_eq!(promoted.memory_type, MemoryType::LongTerm);
        assert_eq!(promoted.importance_score, 0.8);
        assert_eq!(promoted.accessed_at, 99);
    }

    #[test]
    fn test_promotion_keeps_higher_score() {
        let promoted = item(MemoryType::ShortTerm, 0.95).promoted(0.8, 99);
        assert_eq!(promoted.importance_score, 0.95);
    }

    #[test]
    fn test_promotion_of_long_term_is_noop() {
        let original = item(MemoryType::LongTerm, 0.8);
        assert_eq!(original.promoted(0.8, 500), original);
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!(Sender::parse("airi").unwrap(), Sender::Airi);
        assert!(Sender::parse("bot").is_err());
        assert_eq!(MemoryType::LongTerm.as_str(), "long_term");
        assert_eq!(
            MemoryType::parse("short_term").unwrap(),
            MemoryType::ShortTerm
        );
    }
}
