/// User, conversation and exchange-message persistence
///
/// All queries use parameterized queries for SQL injection prevention.
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::store::{now_millis, Conversation, ExchangeRecord, Sender, User};

/// Repository for users, conversations and their messages
pub struct ConversationRepository {
    pool: SqlitePool,
}

impl ConversationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up a user by username
    pub async fn find_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, email, preferences, created_at, updated_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query user")?;

        row.map(|r| user_from_row(&r)).transpose()
    }

    /// Create the user if missing and return it
    ///
    /// `INSERT OR IGNORE` makes concurrent first connections for the same
    /// username converge on a single row.
    pub async fn ensure_user(&self, username: &str) -> Result<User> {
        let now = now_millis();

        sqlx::query(
            "INSERT OR IGNORE INTO users (id, username, preferences, created_at, updated_at) VALUES (?, ?, '{}', ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(username)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create user")?;

        self.find_user(username)
            .await?
            .with_context(|| format!("User {} missing after insert", username))
    }

    pub async fn create_conversation(&self, user_id: &str, title: &str) -> Result<Conversation> {
        let now = now_millis();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            metadata: serde_json::json!({ "created_by": "airi-system" }),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, metadata, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.metadata.to_string())
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create conversation")?;

        Ok(conversation)
    }

    /// Most recently updated first
    pub async fn list_conversations(&self, user_id: &str, limit: i64) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, metadata, created_at, updated_at
            FROM conversations
            WHERE user_id = ?
            ORDER BY updated_at DESC, created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list conversations")?;

        rows.iter().map(conversation_from_row).collect()
    }

    /// Append a message to a conversation and bump its `updated_at`
    pub async fn save_message(
        &self,
        conversation_id: &str,
        sender: Sender,
        content: &str,
        message_type: &str,
        metadata: serde_json::Value,
    ) -> Result<ExchangeRecord> {
        let record = ExchangeRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender,
            content: content.to_string(),
            message_type: message_type.to_string(),
            metadata,
            created_at: now_millis(),
        };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, seq, sender, content, message_type, metadata, created_at)
            VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?), ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(&record.conversation_id)
        .bind(record.sender.as_str())
        .bind(&record.content)
        .bind(&record.message_type)
        .bind(record.metadata.to_string())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to save message")?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(record.created_at)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update conversation timestamp")?;

        tx.commit().await.context("Failed to commit message")?;

        Ok(record)
    }

    /// Oldest first
    pub async fn get_messages(&self, conversation_id: &str, limit: i64) -> Result<Vec<ExchangeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, sender, content, message_type, metadata, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages")?;

        rows.iter().map(message_from_row).collect()
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let preferences: String = row.get("preferences");
    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        preferences: serde_json::from_str(&preferences).context("Invalid preferences JSON")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let metadata: String = row.get("metadata");
    Ok(Conversation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        metadata: serde_json::from_str(&metadata).context("Invalid conversation metadata")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ExchangeRecord> {
    let sender: String = row.get("sender");
    let metadata: String = row.get("metadata");
    Ok(ExchangeRecord {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender: Sender::parse(&sender)?,
        content: row.get("content"),
        message_type: row.get("message_type"),
        metadata: serde_json::from_str(&metadata).context("Invalid message metadata")?,
        created_at: row.get("created_at"),
    })
}
