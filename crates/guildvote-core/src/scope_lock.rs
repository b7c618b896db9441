use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// One fair mutex per guild, created on first use.
///
/// Waiters on the same guild are served in arrival order; different guilds
/// never block each other.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, guild_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait at most `wait` for exclusive access to `guild_id`.
    pub async fn acquire(&self, guild_id: i64, wait: Duration) -> Result<ScopeHandle, StoreError> {
        let lock = self.lock_for(guild_id);
        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => Ok(ScopeHandle {
                guild_id,
                guard: Some(guard),
            }),
            Err(_) => {
                tracing::debug!(guild_id, ?wait, "scope lock wait timed out");
                Err(StoreError::LockTimeout { guild_id })
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`StoreError::Interrupted`] as soon as `cancel` fires.
    pub async fn acquire_cancellable(
        &self,
        guild_id: i64,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<ScopeHandle, StoreError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Interrupted { guild_id }),
            handle = self.acquire(guild_id, wait) => handle,
        }
    }

    /// Forget the locks of guilds nobody holds or waits for. Returns how
    /// many were dropped.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        // Holders and waiters each keep a clone of the Arc.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    /// Number of guilds with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Proof of exclusive access to one guild. Released on drop.
///
/// Nested operations on the same guild take the handle by reference instead
/// of locking again.
#[derive(Debug)]
pub struct ScopeHandle {
    guild_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ScopeHandle {
    pub fn guild_id(&self) -> i64 {
        self.guild_id
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    /// Release the lock now. Calling it again does nothing.
    pub fn release(&mut self) {
        if self.guard.take().is_some() {
            tracing::trace!(guild_id = self.guild_id, "scope lock released");
        }
    }

    /// Guild of a handle that still holds its lock.
    pub(crate) fn held_guild(&self) -> Result<i64, StoreError> {
        if self.is_held() {
            Ok(self.guild_id)
        } else {
            Err(StoreError::Fatal(format!(
                "scope handle for guild {} used after release",
                self.guild_id
            )))
        }
    }
}
