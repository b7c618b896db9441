use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome counters of the reconciliation scheduler.
#[derive(Debug, Default)]
pub struct ReconcileStats {
    delivered: AtomicU64,
    missing: AtomicU64,
    expired: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
    edits_found: AtomicU64,
    final_refreshes: AtomicU64,
    votes_deleted: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileStatsSnapshot {
    pub delivered: u64,
    pub missing: u64,
    pub expired: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub edits_found: u64,
    pub final_refreshes: u64,
    pub votes_deleted: u64,
    pub pending: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ReconcileStats {
    pub fn record_delivered(&self) {
        bump(&self.delivered, 1);
    }

    pub fn record_missing(&self) {
        bump(&self.missing, 1);
    }

    pub fn record_expired(&self, count: u64) {
        bump(&self.expired, count);
    }

    pub fn record_retried(&self) {
        bump(&self.retried, 1);
    }

    pub fn record_exhausted(&self) {
        bump(&self.exhausted, 1);
    }

    pub fn record_edits_found(&self, count: u64) {
        bump(&self.edits_found, count);
    }

    pub fn record_final_refreshes(&self, count: u64) {
        bump(&self.final_refreshes, count);
    }

    pub fn record_votes_deleted(&self, count: u64) {
        bump(&self.votes_deleted, count);
    }

    pub fn snapshot(&self, pending: u64) -> ReconcileStatsSnapshot {
        ReconcileStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            edits_found: self.edits_found.load(Ordering::Relaxed),
            final_refreshes: self.final_refreshes.load(Ordering::Relaxed),
            votes_deleted: self.votes_deleted.load(Ordering::Relaxed),
            pending,
        }
    }
}
