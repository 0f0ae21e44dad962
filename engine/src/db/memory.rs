//! Memory Repository
//!
//! Stores short-term and long-term memory items and answers the per-tier
//! counts the memory ledger reports.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::store::{now_millis, MemoryCounts, MemoryItem, MemoryType};

/// Repository for memory items
pub struct MemoryRepository {
    pool: SqlitePool,
}

impl MemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        content: &str,
        memory_type: MemoryType,
        importance: f64,
    ) -> Result<MemoryItem> {
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

        sqlx::query(
            r#"
            INSERT INTO memories
                (id, user_id, conversation_id, memory_type, content, importance_score, created_at, accessed_at, access_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.user_id)
        .bind(&item.conversation_id)
        .bind(item.memory_type.as_str())
        .bind(&item.content)
        .bind(item.importance_score)
        .bind(item.created_at)
        .bind(item.accessed_at)
        .bind(item.access_count)
        .execute(&self.pool)
        .await
        .context("Failed to save memory")?;

        Ok(item)
    }

    pub async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, conversation_id, memory_type, content, importance_score,
                   created_at, accessed_at, access_count
            FROM memories
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch memory")?;

        row.map(|r| memory_from_row(&r)).transpose()
    }

    /// Promote a memory to long-term
    ///
    /// Returns `None` when no memory has this id. Already long-term items
    /// are returned untouched.
    pub async fn promote(&self, id: &str, importance_floor: f64) -> Result<Option<MemoryItem>> {
        let Some(current) = self.get(id).await? else {
            return Ok(None);
        };

        if current.memory_type == MemoryType::LongTerm {
            return Ok(Some(current));
        }

        let promoted = current.promoted(importance_floor, now_millis());

        // The memory_type guard keeps a concurrent double promotion from
        // applying the update twice.
        sqlx::query(
            r#"
            UPDATE memories
            SET memory_type = ?, importance_score = ?, accessed_at = ?
            WHERE id = ? AND memory_type = 'short_term'
            "#,
        )
        .bind(promoted.memory_type.as_str())
        .bind(promoted.importance_score)
        .bind(promoted.accessed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to promote memory")?;

        self.get(id).await
    }

    /// Most recently accessed first
    pub async fn list(
        &self,
        user_id: &str,
        memory_type: Option<MemoryType>,
        limit: i64,
    ) -> Result<Vec<MemoryItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, conversation_id, memory_type, content, importance_score,
                   created_at, accessed_at, access_count
            FROM memories
            WHERE user_id = ? AND (? IS NULL OR memory_type = ?)
            ORDER BY accessed_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(memory_type.map(|t| t.as_str().to_string()))
        .bind(memory_type.map(|t| t.as_str().to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list memories")?;

        rows.iter().map(memory_from_row).collect()
    }

    pub async fn counts(&self, user_id: &str) -> Result<MemoryCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN memory_type = 'short_term' THEN 1 ELSE 0 END), 0) AS short_term,
                COALESCE(SUM(CASE WHEN memory_type = 'long_term' THEN 1 ELSE 0 END), 0) AS long_term
            FROM memories
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count memories")?;

        let short_term: i64 = row.get("short_term");
        let long_term: i64 = row.get("long_term");

        Ok(MemoryCounts {
            short_term: short_term.max(0) as u64,
            long_term: long_term.max(0) as u64,
        })
    }
}

fn memory_from_row(row: &SqliteRow) -> Result<MemoryItem> {
    let memory_type: String = row.get("memory_type");
    Ok(MemoryItem {
        id: row.get("id"),
        user_id: row.get("user_id"),
        conversation_id: row.get("conversation_id"),
        memory_type: MemoryType::parse(&memory_type)?,
        content: row.get("content"),
        importance_score: row.get("importance_score"),
        created_at: row.get("created_at"),
        accessed_at: row.get("accessed_at"),
        access_count: row.get("access_count"),
    })
}
