/// Character state persistence
///
/// One row per user holding the character's name, mood and presentation
/// settings. Only stored and read back; nothing in the core interprets it.
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::store::{now_millis, CharacterState};

pub struct CharacterRepository {
    pool: SqlitePool,
}

impl CharacterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the state for `state.user_id`
    pub async fn upsert(&self, state: &CharacterState) -> Result<CharacterState> {
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO character_states
                (user_id, character_name, personality, current_mood, voice_settings, appearance_settings, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                character_name = excluded.character_name,
                personality = excluded.personality,
                current_mood = excluded.current_mood,
                voice_settings = excluded.voice_settings,
                appearance_settings = excluded.appearance_settings,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.user_id)
        .bind(&state.character_name)
        .bind(state.personality.to_string())
        .bind(&state.current_mood)
        .bind(state.voice_settings.to_string())
        .bind(state.appearance_settings.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save character state")?;

        Ok(CharacterState {
            updated_at: now,
            ..state.clone()
        })
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<CharacterState>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, character_name, personality, current_mood, voice_settings,
                   appearance_settings, updated_at
            FROM character_states
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch character state")?;

        row.map(|r| character_from_row(&r)).transpose()
    }
}

fn character_from_row(row: &SqliteRow) -> Result<CharacterState> {
    let personality: String = row.get("personality");
    let voice: String = row.get("voice_settings");
    let appearance: String = row.get("appearance_settings");

    Ok(CharacterState {
        user_id: row.get("user_id"),
        character_name: row.get("character_name"),
        personality: serde_json::from_str(&personality).context("Invalid personality JSON")?,
        current_mood: row.get("current_mood"),
        voice_settings: serde_json::from_str(&voice).context("Invalid voice settings JSON")?,
        appearance_settings: serde_json::from_str(&appearance)
            .context("Invalid appearance settings JSON")?,
        updated_at: row.get("updated_at"),
    })
}
