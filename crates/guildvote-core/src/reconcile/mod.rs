//! Keeps posted poll messages in sync with stored poll state.
//!
//! Refresh requests are queued per poll and worked off one per tick. Failed
//! refreshes are retried after a fixed pause until they run out of attempts
//! or time out. Two periodic sweeps run alongside the ticks: one re-queues
//! edits whose refresh was lost and gives ended polls a last refresh, the
//! other deletes polls past retention.

mod queue;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::{add_std, sub_std, Clock};
use crate::error::StoreError;
use crate::gateway::{Gateway, GatewayError};
use crate::observability::{ReconcileStats, ReconcileStatsSnapshot};
use crate::render::Renderer;
use crate::store::{PollKey, VoteStore};

pub use queue::ReconciliationEntry;
use queue::PendingQueue;

/// Edits recorded shortly before the previous sweep started are looked at
/// again, so edits committed while that sweep ran are not missed.
const EDIT_SWEEP_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Pause between two ticks of the worker.
    pub update_interval: Duration,
    pub edit_sweep_interval: Duration,
    pub expiry_sweep_interval: Duration,
    /// How long a queued refresh stays worth delivering.
    pub update_timeout: Duration,
    pub retry_interval: Duration,
    /// Longest wait for one message edit before it counts as failed.
    pub gateway_timeout: Duration,
    /// Attempts per refresh, including the first one.
    pub max_tries: u32,
    /// Polls are deleted this long after they ended.
    pub retention: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(1),
            edit_sweep_interval: Duration::from_secs(10),
            expiry_sweep_interval: Duration::from_secs(3 * 60 * 60),
            update_timeout: Duration::from_secs(60 * 60),
            retry_interval: Duration::from_secs(30),
            gateway_timeout: Duration::from_secs(30),
            max_tries: 5,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

/// What a single [`ReconciliationScheduler::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was eligible.
    Idle,
    Delivered,
    /// The poll or its message no longer exists; the entry was dropped.
    Missing,
    /// The attempt failed and the entry was requeued.
    Retrying { attempts: u32 },
    /// The attempt failed and no attempts are left.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl ReconcileError {
    fn is_missing(&self) -> bool {
        matches!(
            self,
            ReconcileError::Store(StoreError::NotFound) | ReconcileError::Gateway(GatewayError::NotFound)
        )
    }
}

pub struct ReconciliationScheduler {
    store: Arc<VoteStore>,
    renderer: Arc<dyn Renderer>,
    gateway: Arc<dyn Gateway>,
    clock: Arc<dyn Clock>,
    config: ReconcileConfig,
    queue: Mutex<PendingQueue>,
    /// Refresh taken off the queue by the tick that is still running.
    in_flight: Mutex<Option<PollKey>>,
    reachable: DashSet<i64>,
    /// Start of the last successful missed-edits sweep.
    edit_cursor: Mutex<Option<DateTime<Utc>>>,
    stats: ReconcileStats,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationScheduler {
    pub fn new(
        store: Arc<VoteStore>,
        renderer: Arc<dyn Renderer>,
        gateway: Arc<dyn Gateway>,
        config: ReconcileConfig,
    ) -> Self {
        let clock = store.clock();
        Self {
            store,
            renderer,
            gateway,
            clock,
            config,
            queue: Mutex::new(PendingQueue::default()),
            in_flight: Mutex::new(None),
            reachable: DashSet::new(),
            edit_cursor: Mutex::new(None),
            stats: ReconcileStats::default(),
            shutdown: Arc::new(Notify::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    fn lock_queue(&self) -> MutexGuard<'_, PendingQueue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<PollKey>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_cursor(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        match self.edit_cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Request a refresh of one poll message. A refresh already queued for
    /// the same poll is kept and its timeout extended.
    pub fn enqueue(&self, guild_id: i64, poll_id: i64) -> bool {
        let now = self.clock.now();
        let entry = ReconciliationEntry::new(
            PollKey::new(guild_id, poll_id),
            now,
            add_std(now, self.config.update_timeout),
        );
        let added = self.lock_queue().upsert(entry);
        tracing::trace!(guild_id, poll_id, added, "refresh queued");
        added
    }

    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Queued refreshes in the order they will be considered.
    pub fn queued(&self) -> Vec<ReconciliationEntry> {
        self.lock_queue().snapshot()
    }

    pub fn stats(&self) -> ReconcileStatsSnapshot {
        self.stats.snapshot(self.pending() as u64)
    }

    pub fn is_reachable(&self, guild_id: i64) -> bool {
        self.reachable.contains(&guild_id)
    }

    /// Mark a guild reachable and requeue the refreshes persisted for it at
    /// the last shutdown. Returns how many were restored.
    pub async fn on_scope_reachable(&self, guild_id: i64) -> Result<usize, StoreError> {
        self.reachable.insert(guild_id);
        let restored = self.store.load_and_clear_queue_snapshot(guild_id).await?;
        for key in &restored {
            self.enqueue(key.guild_id, key.poll_id);
        }
        tracing::info!(guild_id, restored = restored.len(), "guild reachable");
        Ok(restored.len())
    }

    /// Queued refreshes of an unreachable guild wait until it comes back.
    pub fn on_scope_unreachable(&self, guild_id: i64) {
        if self.reachable.remove(&guild_id).is_some() {
            tracing::warn!(guild_id, "guild unreachable; holding its refreshes");
        }
    }

    /// Process at most one eligible refresh.
    pub async fn tick(&self) -> TickOutcome {
        let now = self.clock.now();
        let popped = self
            .lock_queue()
            .pop_eligible(now, |guild_id| self.reachable.contains(&guild_id));

        if !popped.expired.is_empty() {
            for entry in &popped.expired {
                tracing::debug!(
                    guild_id = entry.key.guild_id,
                    poll_id = entry.key.poll_id,
                    attempts = entry.attempts,
                    "refresh timed out"
                );
            }
            self.stats.record_expired(popped.expired.len() as u64);
        }

        let Some(mut entry) = popped.entry else {
            return TickOutcome::Idle;
        };
        let PollKey { guild_id, poll_id } = entry.key;

        *self.lock_in_flight() = Some(entry.key);
        let result = self.refresh(entry.key).await;
        self.lock_in_flight().take();

        let err = match result {
            Ok(()) => {
                self.stats.record_delivered();
                tracing::debug!(guild_id, poll_id, "poll message refreshed");
                return TickOutcome::Delivered;
            }
            Err(err) => err,
        };

        if err.is_missing() {
            self.stats.record_missing();
            tracing::debug!(guild_id, poll_id, "dropping refresh of missing poll: {err}");
            return TickOutcome::Missing;
        }

        entry.attempts += 1;
        let attempts = entry.attempts;
        if attempts >= self.config.max_tries {
            self.stats.record_exhausted();
            tracing::error!(guild_id, poll_id, attempts, "giving up on poll refresh: {err}");
            return TickOutcome::Exhausted { attempts };
        }

        entry.next_try = add_std(self.clock.now(), self.config.retry_interval);
        self.lock_queue().upsert(entry);
        self.stats.record_retried();
        tracing::warn!(guild_id, poll_id, attempts, "poll refresh failed, will retry: {err}");
        TickOutcome::Retrying { attempts }
    }

    async fn refresh(&self, key: PollKey) -> Result<(), ReconcileError> {
        let (vote, edit) = {
            let scope = self.store.lock_scope(key.guild_id).await?;
            let vote = self.store.get_vote(&scope, key.poll_id).await?;
            let edit = self.store.last_edit(&scope, key.poll_id).await?;
            (vote, edit)
        };
        let text = self.renderer.render_vote_message(&vote);
        let update = self
            .gateway
            .update_message(key.guild_id, vote.channel_id, key.poll_id, text);
        match tokio::time::timeout(self.config.gateway_timeout, update).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::Transient(format!(
                    "no response within {:?}",
                    self.config.gateway_timeout
                ))
                .into())
            }
        }

        // The delivered text already shows this edit.
        if let Err(err) = self.store.mark_last_edit_seen(&[edit]).await {
            tracing::warn!(
                guild_id = key.guild_id,
                poll_id = key.poll_id,
                "could not acknowledge delivered edit: {err}"
            );
        }
        Ok(())
    }

    /// Queue a refresh for every poll edited since shortly before the last
    /// sweep whose edit has not been seen yet, then acknowledge those edits.
    /// Polls that ended since are queued for one last refresh as well.
    /// Returns how many refreshes were requested.
    pub async fn sweep_missed_edits(&self) -> Result<usize, StoreError> {
        let started = self.clock.now();
        let cutoff = match *self.lock_cursor() {
            Some(previous) => sub_std(previous, EDIT_SWEEP_SLACK),
            None => DateTime::<Utc>::MIN_UTC,
        };

        let edits = self.store.polls_edited_since(cutoff).await?;
        for edit in &edits {
            self.enqueue(edit.key.guild_id, edit.key.poll_id);
        }
        self.store.mark_last_edit_seen(&edits).await?;
        *self.lock_cursor() = Some(started);

        if !edits.is_empty() {
            self.stats.record_edits_found(edits.len() as u64);
            tracing::info!(found = edits.len(), "queued refreshes for missed edits");
        }

        let ended = self.store.polls_ended_unrefreshed(started).await?;
        for key in &ended {
            self.enqueue(key.guild_id, key.poll_id);
        }
        self.store.mark_final_refresh_queued(&ended).await?;
        if !ended.is_empty() {
            self.stats.record_final_refreshes(ended.len() as u64);
            tracing::info!(ended = ended.len(), "queued final refreshes of ended polls");
        }
        Ok(edits.len() + ended.len())
    }

    /// Delete polls that ended more than the retention period ago.
    pub async fn sweep_expired_votes(&self) -> Result<u64, StoreError> {
        let cutoff = sub_std(self.clock.now(), self.config.retention);
        let deleted = self.store.delete_expired_votes(cutoff).await?;
        self.stats.record_votes_deleted(deleted);
        Ok(deleted)
    }

    /// Spawn the worker that ticks and runs both sweeps until [`shutdown`].
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            tracing::warn!("reconciliation worker already running");
            return;
        }

        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        *worker = Some(tokio::spawn(async move {
            let mut updates = delayed_interval(this.config.update_interval).await;
            let mut edits = delayed_interval(this.config.edit_sweep_interval).await;
            let mut expiry = delayed_interval(this.config.expiry_sweep_interval).await;

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = updates.tick() => {
                        this.tick().await;
                    }
                    _ = edits.tick() => {
                        if let Err(err) = this.sweep_missed_edits().await {
                            tracing::error!("missed-edits sweep failed: {err}");
                        }
                    }
                    _ = expiry.tick() => {
                        if let Err(err) = this.sweep_expired_votes().await {
                            tracing::error!("expired-polls sweep failed: {err}");
                        }
                    }
                }
            }
            tracing::info!("reconciliation worker stopped");
        }));
        tracing::info!(
            update_interval_ms = self.config.update_interval.as_millis() as u64,
            max_tries = self.config.max_tries,
            "reconciliation worker started"
        );
    }

    /// Stop the worker, letting an in-flight tick finish within the grace
    /// period, then persist every queued refresh. A refresh the aborted tick
    /// was still working on is saved too. Returns how many were saved.
    pub async fn shutdown(&self) -> Result<usize, StoreError> {
        self.shutdown.notify_one();
        let worker = self.lock_worker().take();
        if let Some(handle) = worker {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.config.shutdown_grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!("reconciliation worker panicked: {err}"),
                Err(_) => {
                    tracing::warn!(
                        grace_secs = self.config.shutdown_grace.as_secs(),
                        "reconciliation worker did not stop in time; aborting"
                    );
                    abort.abort();
                }
            }
        }

        let mut keys: Vec<PollKey> = self.lock_in_flight().take().into_iter().collect();
        if let Some(key) = keys.first() {
            tracing::warn!(
                guild_id = key.guild_id,
                poll_id = key.poll_id,
                "saving refresh interrupted by shutdown"
            );
        }
        keys.extend(self.lock_queue().drain().into_iter().map(|entry| entry.key));
        self.store.persist_queue_snapshot(&keys).await?;
        tracing::info!(saved = keys.len(), "pending refreshes persisted");
        Ok(keys.len())
    }
}

/// Interval whose first tick fires one `period` from now.
async fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    interval
}

#[cfg(test)]
mod tests;
