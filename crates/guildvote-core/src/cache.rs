use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use guildvote_models::{Vote, VoteSettings};

/// Cache key for one poll: (guild_id, poll_id).
pub type VoteCacheKey = (i64, i64);

pub type SettingsCache = moka::future::Cache<i64, VoteSettings>;
pub type VoteCache = moka::future::Cache<VoteCacheKey, Vote>;
pub type PollIdCache = moka::future::Cache<i64, Arc<BTreeSet<i64>>>;

/// Build a read-through cache with the given capacity and time-to-live.
pub fn build_cache<K, V>(max_capacity: u64, ttl: Duration) -> moka::future::Cache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    moka::future::Cache::builder()
        .max_capacity(max_capacity)
        .time_to_live(ttl)
        .build()
}

/// The three read caches of the vote store.
#[derive(Clone)]
pub struct StoreCaches {
    pub settings: SettingsCache,
    pub votes: VoteCache,
    pub poll_ids: PollIdCache,
}

impl StoreCaches {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            settings: build_cache(max_capacity, ttl),
            votes: build_cache(max_capacity, ttl),
            poll_ids: build_cache(max_capacity, ttl),
        }
    }

    /// Forget a poll and the id list of its guild.
    pub async fn invalidate_vote(&self, guild_id: i64, poll_id: i64) {
        self.votes.invalidate(&(guild_id, poll_id)).await;
        self.poll_ids.invalidate(&guild_id).await;
    }

    pub fn invalidate_all(&self) {
        self.settings.invalidate_all();
        self.votes.invalidate_all();
        self.poll_ids.invalidate_all();
    }
}
