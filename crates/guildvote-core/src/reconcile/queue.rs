use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::store::PollKey;

/// A pending refresh of one poll message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationEntry {
    pub key: PollKey,
    /// After this instant the refresh is abandoned.
    pub timeout: DateTime<Utc>,
    /// Not attempted before this instant.
    pub next_try: DateTime<Utc>,
    /// Failed attempts so far.
    pub attempts: u32,
}

impl ReconciliationEntry {
    pub fn new(key: PollKey, now: DateTime<Utc>, timeout: DateTime<Utc>) -> Self {
        Self {
            key,
            timeout,
            next_try: now,
            attempts: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout < now
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_try <= now
    }
}

/// Result of [`PendingQueue::pop_eligible`].
#[derive(Debug, Default)]
pub(crate) struct Popped {
    pub entry: Option<ReconciliationEntry>,
    pub expired: Vec<ReconciliationEntry>,
}

/// FIFO of refreshes with at most one entry per poll.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    order: VecDeque<PollKey>,
    entries: HashMap<PollKey, ReconciliationEntry>,
}

impl PendingQueue {
    /// Insert `entry`, or merge it into the queued entry of the same poll,
    /// keeping that entry's place and the later of both timeouts.
    /// Returns whether a new entry was added.
    pub fn upsert(&mut self, entry: ReconciliationEntry) -> bool {
        match self.entries.get_mut(&entry.key) {
            Some(existing) => {
                existing.timeout = existing.timeout.max(entry.timeout);
                false
            }
            None => {
                self.order.push_back(entry.key);
                self.entries.insert(entry.key, entry);
                true
            }
        }
    }

    /// Remove the first entry that is due and belongs to a reachable guild.
    ///
    /// Entries past their timeout are dropped along the way. Entries scanned
    /// but not yet eligible move to the tail in their original order.
    pub fn pop_eligible(
        &mut self,
        now: DateTime<Utc>,
        is_reachable: impl Fn(i64) -> bool,
    ) -> Popped {
        let mut popped = Popped::default();
        let mut deferred = Vec::new();
        while let Some(key) = self.order.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.is_expired(now) {
                if let Some(entry) = self.entries.remove(&key) {
                    popped.expired.push(entry);
                }
            } else if entry.is_due(now) && is_reachable(key.guild_id) {
                popped.entry = self.entries.remove(&key);
                break;
            } else {
                deferred.push(key);
            }
        }
        self.order.extend(deferred);
        popped
    }

    /// Empty the queue, returning the entries in queue order.
    pub fn drain(&mut self) -> Vec<ReconciliationEntry> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for key in self.order.drain(..) {
            if let Some(entry) = self.entries.remove(&key) {
                entries.push(entry);
            }
        }
        self.entries.clear();
        entries
    }

    /// Entries in queue order.
    pub fn snapshot(&self) -> Vec<ReconciliationEntry> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
