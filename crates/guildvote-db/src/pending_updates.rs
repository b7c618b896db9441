use crate::{DbError, DbPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingUpdateRow {
    pub guild_id: i64,
    pub vote_id: i64,
}

/// Store pending display refreshes. Already stored pairs are kept once.
pub async fn save_pending_updates(
    pool: &DbPool,
    updates: &[PendingUpdateRow],
) -> Result<u64, DbError> {
    if updates.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut saved = 0;
    for update in updates {
        let result = sqlx::query(
            "INSERT INTO pending_updates (guild_id, vote_id)
             VALUES (?1, ?2)
             ON CONFLICT (guild_id, vote_id) DO NOTHING",
        )
        .bind(update.guild_id)
        .bind(update.vote_id)
        .execute(&mut *tx)
        .await?;
        saved += result.rows_affected();
    }
    tx.commit().await?;
    Ok(saved)
}

/// Remove and return every pending refresh of one guild.
pub async fn take_pending_updates(
    pool: &DbPool,
    guild_id: i64,
) -> Result<Vec<PendingUpdateRow>, DbError> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query_as::<_, PendingUpdateRow>(
        "SELECT guild_id, vote_id FROM pending_updates
         WHERE guild_id = ?1
         ORDER BY vote_id",
    )
    .bind(guild_id)
    .fetch_all(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM pending_updates WHERE guild_id = ?1")
        .bind(guild_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(rows)
}
