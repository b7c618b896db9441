use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use guildvote_db::pending_updates::{self, PendingUpdateRow};
use guildvote_db::votes::{self, EditedVoteRow, VoteKeyRow};
use guildvote_db::{settings, DbPool};
use guildvote_models::{Vote, VoteEdit, VoteSettings};
use tokio_util::sync::CancellationToken;

use crate::ballot;
use crate::cache::StoreCaches;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::scope_lock::{ScopeHandle, ScopeLocks};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long `lock_scope` waits for a busy guild.
    pub lock_wait: Duration,
    pub cache_max_capacity: u64,
    pub cache_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(10),
            cache_max_capacity: 1_000_000,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A poll identified across guilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PollKey {
    pub guild_id: i64,
    pub poll_id: i64,
}

impl PollKey {
    pub fn new(guild_id: i64, poll_id: i64) -> Self {
        Self { guild_id, poll_id }
    }
}

/// A poll edit that no sweep has acknowledged yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEdit {
    pub key: PollKey,
    pub edited_at: DateTime<Utc>,
}

impl PollEdit {
    fn from_row(row: EditedVoteRow) -> Result<Self, StoreError> {
        let edited_at = DateTime::from_timestamp_millis(row.edited_at).ok_or_else(|| {
            StoreError::Fatal(format!("edit time {} out of range", row.edited_at))
        })?;
        Ok(Self {
            key: PollKey::new(row.guild_id, row.id),
            edited_at,
        })
    }

    fn to_row(self) -> EditedVoteRow {
        EditedVoteRow {
            guild_id: self.key.guild_id,
            id: self.key.poll_id,
            edited_at: self.edited_at.timestamp_millis(),
        }
    }
}

/// Durable, per-guild partitioned store of polls and default settings.
///
/// Every per-guild operation takes a [`ScopeHandle`] proving the caller holds
/// that guild's lock. Reads go through TTL caches; writes go to the database
/// first and invalidate the cached entries afterwards.
pub struct VoteStore {
    pool: DbPool,
    locks: ScopeLocks,
    caches: StoreCaches,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl VoteStore {
    pub fn new(pool: DbPool, config: StoreConfig) -> Self {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: DbPool, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let caches = StoreCaches::new(config.cache_max_capacity, config.cache_ttl);
        Self {
            pool,
            locks: ScopeLocks::new(),
            caches,
            clock,
            config,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // -- Scope locks ----------------------------------------------------------

    pub async fn acquire_scope(&self, guild_id: i64, wait: Duration) -> Result<ScopeHandle, StoreError> {
        self.locks.acquire(guild_id, wait).await
    }

    pub async fn acquire_scope_cancellable(
        &self,
        guild_id: i64,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<ScopeHandle, StoreError> {
        self.locks.acquire_cancellable(guild_id, wait, cancel).await
    }

    /// Acquire a guild with the configured lock wait.
    pub async fn lock_scope(&self, guild_id: i64) -> Result<ScopeHandle, StoreError> {
        self.locks.acquire(guild_id, self.config.lock_wait).await
    }

    // -- Default settings -----------------------------------------------------

    /// The guild's default poll settings, or the system defaults when the
    /// guild never configured any.
    pub async fn get_default_settings(&self, scope: &ScopeHandle) -> Result<VoteSettings, StoreError> {
        let guild_id = scope.held_guild()?;
        if let Some(settings) = self.caches.settings.get(&guild_id).await {
            return Ok(settings);
        }
        let settings = match settings::get_guild_settings(&self.pool, guild_id).await? {
            Some(row) => row.into_settings()?,
            None => VoteSettings::system_default(),
        };
        self.caches.settings.insert(guild_id, settings.clone()).await;
        Ok(settings)
    }

    pub async fn set_default_settings(
        &self,
        scope: &ScopeHandle,
        settings: &VoteSettings,
    ) -> Result<(), StoreError> {
        let guild_id = scope.held_guild()?;
        settings::upsert_guild_settings(&self.pool, guild_id, settings).await?;
        self.caches.settings.invalidate(&guild_id).await;
        tracing::debug!(guild_id, "default settings updated");
        Ok(())
    }

    // -- Polls ----------------------------------------------------------------

    pub async fn get_vote(&self, scope: &ScopeHandle, poll_id: i64) -> Result<Vote, StoreError> {
        let guild_id = scope.held_guild()?;
        let key = (guild_id, poll_id);
        if let Some(vote) = self.caches.votes.get(&key).await {
            return Ok(vote);
        }
        let vote = votes::get_vote(&self.pool, guild_id, poll_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        self.caches.votes.insert(key, vote.clone()).await;
        Ok(vote)
    }

    /// Store a new poll under `poll_id` in the scoped guild. The poll's own
    /// guild and id fields are overwritten with the scope's.
    pub async fn insert_vote(
        &self,
        scope: &ScopeHandle,
        poll_id: i64,
        mut vote: Vote,
    ) -> Result<(), StoreError> {
        let guild_id = scope.held_guild()?;
        vote.guild_id = guild_id;
        vote.id = poll_id;
        vote.validate()?;
        votes::insert_vote(&self.pool, &vote, self.now_millis()).await?;
        self.caches.invalidate_vote(guild_id, poll_id).await;
        tracing::debug!(guild_id, poll_id, "poll inserted");
        Ok(())
    }

    /// Replace title, description and settings of an existing poll. Options
    /// and answers stay as stored.
    pub async fn update_vote(
        &self,
        scope: &ScopeHandle,
        poll_id: i64,
        vote: &Vote,
    ) -> Result<(), StoreError> {
        let guild_id = scope.held_guild()?;
        vote.validate()?;
        votes::update_vote_details(
            &self.pool,
            guild_id,
            poll_id,
            &vote.title,
            &vote.description,
            &vote.settings,
            self.now_millis(),
        )
        .await?;
        self.caches.votes.invalidate(&(guild_id, poll_id)).await;
        tracing::debug!(guild_id, poll_id, "poll updated");
        Ok(())
    }

    /// Apply a partial edit and return the edited poll.
    pub async fn edit_vote(
        &self,
        scope: &ScopeHandle,
        poll_id: i64,
        edit: VoteEdit,
    ) -> Result<Vote, StoreError> {
        let current = self.get_vote(scope, poll_id).await?;
        let edited = current.apply(edit)?;
        self.update_vote(scope, poll_id, &edited).await?;
        Ok(edited)
    }

    /// Make `chosen` the complete answer set of `voter_id`. An empty set
    /// withdraws the voter. Repeating the same call changes nothing.
    pub async fn cast_votes(
        &self,
        scope: &ScopeHandle,
        voter_id: i64,
        poll_id: i64,
        chosen: &[i64],
    ) -> Result<(), StoreError> {
        let guild_id = scope.held_guild()?;
        let chosen: BTreeSet<i64> = chosen.iter().copied().collect();
        let vote = self.get_vote(scope, poll_id).await?;
        ballot::check_selection(&vote, &chosen)
            .map_err(|rejection| StoreError::Invalid(rejection.to_string()))?;

        let option_ids: Vec<i64> = chosen.into_iter().collect();
        votes::replace_answers(
            &self.pool,
            guild_id,
            poll_id,
            voter_id,
            &option_ids,
            self.now_millis(),
        )
        .await?;
        self.caches.votes.invalidate(&(guild_id, poll_id)).await;
        tracing::debug!(guild_id, poll_id, voter_id, answers = option_ids.len(), "answers replaced");
        Ok(())
    }

    pub async fn list_poll_ids(&self, scope: &ScopeHandle) -> Result<BTreeSet<i64>, StoreError> {
        let guild_id = scope.held_guild()?;
        if let Some(ids) = self.caches.poll_ids.get(&guild_id).await {
            return Ok(ids.as_ref().clone());
        }
        let ids: BTreeSet<i64> = votes::get_guild_vote_ids(&self.pool, guild_id)
            .await?
            .into_iter()
            .collect();
        self.caches.poll_ids.insert(guild_id, Arc::new(ids.clone())).await;
        Ok(ids)
    }

    // -- Cross-guild maintenance ----------------------------------------------

    /// Delete every poll whose end lies strictly before `before`, locking each
    /// affected guild in turn. A guild that stays busy for the whole lock wait
    /// is skipped until the next sweep.
    pub async fn delete_expired_votes(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = cutoff_seconds(before);
        let mut by_guild: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for key in votes::get_votes_ended_before(&self.pool, cutoff).await? {
            by_guild.entry(key.guild_id).or_default().push(key.id);
        }

        let mut deleted = 0;
        for (guild_id, poll_ids) in by_guild {
            let scope = match self.lock_scope(guild_id).await {
                Ok(scope) => scope,
                Err(err @ StoreError::LockTimeout { .. }) => {
                    tracing::warn!(guild_id, "skipping expired polls of busy guild: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for poll_id in poll_ids {
                if votes::delete_vote_ended_before(&self.pool, guild_id, poll_id, cutoff).await? {
                    deleted += 1;
                    self.caches.invalidate_vote(guild_id, poll_id).await;
                }
            }
            drop(scope);
        }

        if deleted > 0 {
            tracing::info!(deleted, %before, "expired polls deleted");
        }
        let pruned = self.locks.prune_idle();
        if pruned > 0 {
            tracing::debug!(pruned, "idle guild locks dropped");
        }
        Ok(deleted)
    }

    /// Polls that ended before `now` and have not had their final refresh.
    pub async fn polls_ended_unrefreshed(&self, now: DateTime<Utc>) -> Result<Vec<PollKey>, StoreError> {
        Ok(votes::get_votes_awaiting_final_refresh(&self.pool, cutoff_seconds(now))
            .await?
            .into_iter()
            .map(|row| PollKey::new(row.guild_id, row.id))
            .collect())
    }

    /// Record that the final refresh of each poll has been queued.
    pub async fn mark_final_refresh_queued(&self, keys: &[PollKey]) -> Result<u64, StoreError> {
        let rows: Vec<VoteKeyRow> = keys
            .iter()
            .map(|key| VoteKeyRow {
                guild_id: key.guild_id,
                id: key.poll_id,
            })
            .collect();
        Ok(votes::mark_final_refreshed(&self.pool, &rows).await?)
    }

    /// The latest edit of a poll, read under the guild lock so it matches
    /// the state returned by [`get_vote`](Self::get_vote).
    pub async fn last_edit(&self, scope: &ScopeHandle, poll_id: i64) -> Result<PollEdit, StoreError> {
        let guild_id = scope.held_guild()?;
        let row = votes::get_vote_edit(&self.pool, guild_id, poll_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        PollEdit::from_row(row)
    }

    /// Polls edited at or after `cutoff` whose edit is not yet acknowledged.
    pub async fn polls_edited_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<PollEdit>, StoreError> {
        votes::get_unseen_edits_since(&self.pool, cutoff.timestamp_millis())
            .await?
            .into_iter()
            .map(PollEdit::from_row)
            .collect()
    }

    /// Acknowledge edits returned by [`polls_edited_since`](Self::polls_edited_since).
    pub async fn mark_last_edit_seen(&self, edits: &[PollEdit]) -> Result<u64, StoreError> {
        let rows: Vec<EditedVoteRow> = edits.iter().map(|edit| edit.to_row()).collect();
        Ok(votes::mark_edits_seen(&self.pool, &rows).await?)
    }

    pub async fn persist_queue_snapshot(&self, keys: &[PollKey]) -> Result<u64, StoreError> {
        let rows: Vec<PendingUpdateRow> = keys
            .iter()
            .map(|key| PendingUpdateRow {
                guild_id: key.guild_id,
                vote_id: key.poll_id,
            })
            .collect();
        Ok(pending_updates::save_pending_updates(&self.pool, &rows).await?)
    }

    /// Take the persisted refreshes of one guild, leaving none behind.
    pub async fn load_and_clear_queue_snapshot(&self, guild_id: i64) -> Result<Vec<PollKey>, StoreError> {
        Ok(pending_updates::take_pending_updates(&self.pool, guild_id)
            .await?
            .into_iter()
            .map(|row| PollKey::new(row.guild_id, row.vote_id))
            .collect())
    }

    pub fn clear_caches(&self) {
        self.caches.invalidate_all();
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

/// Smallest whole second `s` such that `end < s` holds exactly for the
/// whole-second ends strictly before `before`.
fn cutoff_seconds(before: DateTime<Utc>) -> i64 {
    if before.timestamp_subsec_nanos() == 0 {
        before.timestamp()
    } else {
        before.timestamp() + 1
    }
}
