use std::collections::{BTreeSet, HashMap};

use guildvote_models::{Vote, VoteOption, VoteSettings};

use crate::settings::settings_from_columns;
use crate::{datetime_from_unix_seconds, DbError, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoteRow {
    pub guild_id: i64,
    pub id: i64,
    pub channel_id: i64,
    pub title: String,
    pub description: String,
    pub start_at: i64,
    pub answers_per_user: i64,
    pub duration_seconds: i64,
    pub can_change_answers: bool,
    pub timezone: String,
    pub edited_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoteOptionRow {
    pub id: i64,
    pub position: i64,
    pub name: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoteAnswerRow {
    pub option_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct VoteKeyRow {
    pub guild_id: i64,
    pub id: i64,
}

/// A poll whose last edit has not been acknowledged yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct EditedVoteRow {
    pub guild_id: i64,
    pub id: i64,
    pub edited_at: i64,
}

fn assemble_vote(
    row: VoteRow,
    options: Vec<VoteOptionRow>,
    answers: Vec<VoteAnswerRow>,
) -> Result<Vote, DbError> {
    let settings: VoteSettings = settings_from_columns(
        row.answers_per_user,
        row.duration_seconds,
        row.can_change_answers,
        row.timezone,
    )?;

    let mut voters: HashMap<i64, BTreeSet<i64>> = HashMap::new();
    for answer in answers {
        voters.entry(answer.option_id).or_default().insert(answer.user_id);
    }

    let options = options
        .into_iter()
        .map(|option| VoteOption {
            voters: voters.remove(&option.id).unwrap_or_default(),
            id: option.id,
            name: option.name,
        })
        .collect();

    let vote = Vote {
        id: row.id,
        guild_id: row.guild_id,
        channel_id: row.channel_id,
        title: row.title,
        description: row.description,
        start: datetime_from_unix_seconds(row.start_at)?,
        options,
        settings,
    };
    vote.validate().map_err(|e| {
        DbError::Corrupt(format!("vote {} in guild {}: {e}", vote.id, vote.guild_id))
    })?;
    Ok(vote)
}

/// Load a poll with its options and answers from a single read snapshot.
pub async fn get_vote(pool: &DbPool, guild_id: i64, vote_id: i64) -> Result<Option<Vote>, DbError> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, VoteRow>(
        "SELECT guild_id, id, channel_id, title, description, start_at,
                answers_per_user, duration_seconds, can_change_answers, timezone, edited_at
         FROM votes WHERE guild_id = ?1 AND id = ?2",
    )
    .bind(guild_id)
    .bind(vote_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let options = sqlx::query_as::<_, VoteOptionRow>(
        "SELECT id, position, name FROM vote_options
         WHERE guild_id = ?1 AND vote_id = ?2
         ORDER BY position ASC",
    )
    .bind(guild_id)
    .bind(vote_id)
    .fetch_all(&mut *tx)
    .await?;

    let answers = sqlx::query_as::<_, VoteAnswerRow>(
        "SELECT option_id, user_id FROM vote_answers
         WHERE guild_id = ?1 AND vote_id = ?2",
    )
    .bind(guild_id)
    .bind(vote_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    assemble_vote(row, options, answers).map(Some)
}

/// Insert a poll with all options and answers in one transaction.
pub async fn insert_vote(pool: &DbPool, vote: &Vote, edited_at: i64) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO votes (guild_id, id, channel_id, title, description, start_at,
                            answers_per_user, duration_seconds, can_change_answers, timezone, edited_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT (guild_id, id) DO NOTHING",
    )
    .bind(vote.guild_id)
    .bind(vote.id)
    .bind(vote.channel_id)
    .bind(&vote.title)
    .bind(&vote.description)
    .bind(vote.start.timestamp())
    .bind(i64::from(vote.settings.answers_per_user()))
    .bind(vote.settings.duration_seconds())
    .bind(vote.settings.can_change_answers())
    .bind(vote.settings.timezone())
    .bind(edited_at)
    .execute(&mut *tx)
    .await?;
    if inserted.rows_affected() == 0 {
        return Err(DbError::AlreadyExists);
    }

    for (position, option) in (0_i64..).zip(&vote.options) {
        sqlx::query(
            "INSERT INTO vote_options (guild_id, vote_id, id, position, name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(vote.guild_id)
        .bind(vote.id)
        .bind(option.id)
        .bind(position)
        .bind(&option.name)
        .execute(&mut *tx)
        .await?;

        for user_id in &option.voters {
            sqlx::query(
                "INSERT INTO vote_answers (guild_id, vote_id, option_id, user_id)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(vote.guild_id)
            .bind(vote.id)
            .bind(option.id)
            .bind(*user_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Replace the mutable columns of a poll. Options and answers are untouched.
/// A changed duration makes the poll due for another final refresh.
pub async fn update_vote_details(
    pool: &DbPool,
    guild_id: i64,
    vote_id: i64,
    title: &str,
    description: &str,
    settings: &VoteSettings,
    edited_at: i64,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE votes
         SET title = ?3,
             description = ?4,
             answers_per_user = ?5,
             duration_seconds = ?6,
             can_change_answers = ?7,
             timezone = ?8,
             edited_at = ?9,
             final_refreshed = CASE WHEN duration_seconds = ?6 THEN final_refreshed ELSE 0 END
         WHERE guild_id = ?1 AND id = ?2",
    )
    .bind(guild_id)
    .bind(vote_id)
    .bind(title)
    .bind(description)
    .bind(i64::from(settings.answers_per_user()))
    .bind(settings.duration_seconds())
    .bind(settings.can_change_answers())
    .bind(settings.timezone())
    .bind(edited_at)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Atomically replace every answer of `user_id` on a poll with `option_ids`.
pub async fn replace_answers(
    pool: &DbPool,
    guild_id: i64,
    vote_id: i64,
    user_id: i64,
    option_ids: &[i64],
    edited_at: i64,
) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    let touched = sqlx::query("UPDATE votes SET edited_at = ?3 WHERE guild_id = ?1 AND id = ?2")
        .bind(guild_id)
        .bind(vote_id)
        .bind(edited_at)
        .execute(&mut *tx)
        .await?;
    if touched.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    sqlx::query("DELETE FROM vote_answers WHERE guild_id = ?1 AND vote_id = ?2 AND user_id = ?3")
        .bind(guild_id)
        .bind(vote_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    for option_id in option_ids {
        sqlx::query(
            "INSERT INTO vote_answers (guild_id, vote_id, option_id, user_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
        )
        .bind(guild_id)
        .bind(vote_id)
        .bind(*option_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn get_guild_vote_ids(pool: &DbPool, guild_id: i64) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM votes WHERE guild_id = ?1 ORDER BY id")
        .bind(guild_id)
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Polls whose end (`start_at + duration_seconds`) is strictly before `cutoff`.
pub async fn get_votes_ended_before(
    pool: &DbPool,
    cutoff_unix_seconds: i64,
) -> Result<Vec<VoteKeyRow>, DbError> {
    let rows = sqlx::query_as::<_, VoteKeyRow>(
        "SELECT guild_id, id FROM votes
         WHERE start_at + duration_seconds < ?1
         ORDER BY guild_id, id",
    )
    .bind(cutoff_unix_seconds)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn delete_vote_rows(
    tx: &mut sqlx::SqliteConnection,
    guild_id: i64,
    vote_id: i64,
) -> Result<bool, DbError> {
    for table in ["vote_answers", "vote_options", "pending_updates"] {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE guild_id = ?1 AND vote_id = ?2"
        ))
        .bind(guild_id)
        .bind(vote_id)
        .execute(&mut *tx)
        .await?;
    }
    let result = sqlx::query("DELETE FROM votes WHERE guild_id = ?1 AND id = ?2")
        .bind(guild_id)
        .bind(vote_id)
        .execute(&mut *tx)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a poll with its options, answers and pending refresh, but only
/// while it still ended strictly before `cutoff`. A poll extended in the
/// meantime is kept. Returns whether it was deleted.
pub async fn delete_vote_ended_before(
    pool: &DbPool,
    guild_id: i64,
    vote_id: i64,
    cutoff_unix_seconds: i64,
) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;
    let ended: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM votes
         WHERE guild_id = ?1 AND id = ?2 AND start_at + duration_seconds < ?3",
    )
    .bind(guild_id)
    .bind(vote_id)
    .bind(cutoff_unix_seconds)
    .fetch_optional(&mut *tx)
    .await?;
    if ended.is_none() {
        return Ok(false);
    }
    let deleted = delete_vote_rows(&mut *tx, guild_id, vote_id).await?;
    tx.commit().await?;
    Ok(deleted)
}

/// Polls that ended strictly before `cutoff` and never got their final refresh.
pub async fn get_votes_awaiting_final_refresh(
    pool: &DbPool,
    cutoff_unix_seconds: i64,
) -> Result<Vec<VoteKeyRow>, DbError> {
    let rows = sqlx::query_as::<_, VoteKeyRow>(
        "SELECT guild_id, id FROM votes
         WHERE final_refreshed = 0 AND start_at + duration_seconds < ?1
         ORDER BY guild_id, id",
    )
    .bind(cutoff_unix_seconds)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn mark_final_refreshed(pool: &DbPool, keys: &[VoteKeyRow]) -> Result<u64, DbError> {
    if keys.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut marked = 0;
    for key in keys {
        let result = sqlx::query(
            "UPDATE votes SET final_refreshed = 1
             WHERE guild_id = ?1 AND id = ?2 AND final_refreshed = 0",
        )
        .bind(key.guild_id)
        .bind(key.id)
        .execute(&mut *tx)
        .await?;
        marked += result.rows_affected();
    }
    tx.commit().await?;
    Ok(marked)
}

/// The current edit stamp of one poll.
pub async fn get_vote_edit(
    pool: &DbPool,
    guild_id: i64,
    vote_id: i64,
) -> Result<Option<EditedVoteRow>, DbError> {
    let row = sqlx::query_as::<_, EditedVoteRow>(
        "SELECT guild_id, id, edited_at FROM votes WHERE guild_id = ?1 AND id = ?2",
    )
    .bind(guild_id)
    .bind(vote_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Polls edited at or after `cutoff` (unix millis) whose edit is still unseen.
pub async fn get_unseen_edits_since(
    pool: &DbPool,
    cutoff_unix_millis: i64,
) -> Result<Vec<EditedVoteRow>, DbError> {
    let rows = sqlx::query_as::<_, EditedVoteRow>(
        "SELECT guild_id, id, edited_at FROM votes
         WHERE edited_at >= ?1
           AND (edit_seen_at IS NULL OR edit_seen_at < edited_at)
         ORDER BY edited_at ASC",
    )
    .bind(cutoff_unix_millis)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Record the observed edit time of each poll as seen. A poll edited again
/// after it was observed stays unseen.
pub async fn mark_edits_seen(pool: &DbPool, edits: &[EditedVoteRow]) -> Result<u64, DbError> {
    if edits.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut marked = 0;
    for edit in edits {
        let result = sqlx::query(
            "UPDATE votes SET edit_seen_at = ?3
             WHERE guild_id = ?1 AND id = ?2
               AND (edit_seen_at IS NULL OR edit_seen_at < ?3)",
        )
        .bind(edit.guild_id)
        .bind(edit.id)
        .bind(edit.edited_at)
        .execute(&mut *tx)
        .await?;
        marked += result.rows_affected();
    }
    tx.commit().await?;
    Ok(marked)
}
