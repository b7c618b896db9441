use std::time::Duration;

use guildvote_models::VoteSettings;

use crate::{DbError, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GuildSettingsRow {
    pub guild_id: i64,
    pub answers_per_user: i64,
    pub duration_seconds: i64,
    pub can_change_answers: bool,
    pub timezone: String,
}

impl GuildSettingsRow {
    pub fn into_settings(self) -> Result<VoteSettings, DbError> {
        settings_from_columns(
            self.answers_per_user,
            self.duration_seconds,
            self.can_change_answers,
            self.timezone,
        )
    }
}

/// Rebuild validated settings from their stored columns.
pub(crate) fn settings_from_columns(
    answers_per_user: i64,
    duration_seconds: i64,
    can_change_answers: bool,
    timezone: String,
) -> Result<VoteSettings, DbError> {
    let answers = u8::try_from(answers_per_user)
        .map_err(|_| DbError::Corrupt(format!("answers_per_user {answers_per_user}")))?;
    let seconds = u64::try_from(duration_seconds)
        .map_err(|_| DbError::Corrupt(format!("duration_seconds {duration_seconds}")))?;
    VoteSettings::new(
        answers,
        Duration::from_secs(seconds),
        can_change_answers,
        timezone,
    )
    .map_err(|e| DbError::Corrupt(e.to_string()))
}

pub async fn get_guild_settings(
    pool: &DbPool,
    guild_id: i64,
) -> Result<Option<GuildSettingsRow>, DbError> {
    let row = sqlx::query_as::<_, GuildSettingsRow>(
        "SELECT guild_id, answers_per_user, duration_seconds, can_change_answers, timezone
         FROM guild_settings WHERE guild_id = ?1",
    )
    .bind(guild_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn upsert_guild_settings(
    pool: &DbPool,
    guild_id: i64,
    settings: &VoteSettings,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO guild_settings (guild_id, answers_per_user, duration_seconds, can_change_answers, timezone)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (guild_id)
         DO UPDATE SET answers_per_user = ?2, duration_seconds = ?3, can_change_answers = ?4, timezone = ?5",
    )
    .bind(guild_id)
    .bind(i64::from(settings.answers_per_user()))
    .bind(settings.duration_seconds())
    .bind(settings.can_change_answers())
    .bind(settings.timezone())
    .execute(pool)
    .await?;
    Ok(())
}
