use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone};
use guildvote_models::{Vote, VoteSettings};

use super::*;
use crate::clock::ManualClock;
use crate::store::StoreConfig;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

#[derive(Default)]
struct CountingRenderer {
    calls: AtomicU32,
}

impl Renderer for CountingRenderer {
    fn render_vote_message(&self, vote: &Vote) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        format!("{} ({} answers)", vote.title, vote.answer_count())
    }
}

/// Gateway that fails with the scripted errors first, then succeeds.
#[derive(Default)]
struct ScriptedGateway {
    calls: AtomicU32,
    failures: Mutex<VecDeque<GatewayError>>,
    sent: Mutex<Vec<(i64, i64, i64, String)>>,
}

impl ScriptedGateway {
    fn failing_with(errors: impl IntoIterator<Item = GatewayError>) -> Self {
        Self {
            failures: Mutex::new(errors.into_iter().collect()),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn update_message(
        &self,
        guild_id: i64,
        channel_id: i64,
        message_id: i64,
        text: String,
    ) -> Result<(), GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent
            .lock()
            .unwrap()
            .push((guild_id, channel_id, message_id, text));
        Ok(())
    }
}

/// Gateway whose edits never complete.
#[derive(Default)]
struct HangingGateway {
    calls: AtomicU32,
}

#[async_trait]
impl Gateway for HangingGateway {
    async fn update_message(
        &self,
        _guild_id: i64,
        _channel_id: i64,
        _message_id: i64,
        _text: String,
    ) -> Result<(), GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

struct Harness {
    store: Arc<VoteStore>,
    clock: ManualClock,
    renderer: Arc<CountingRenderer>,
    gateway: Arc<ScriptedGateway>,
    scheduler: Arc<ReconciliationScheduler>,
}

impl Harness {
    async fn new(config: ReconcileConfig) -> Self {
        Self::with_gateway(config, ScriptedGateway::default()).await
    }

    async fn with_gateway(config: ReconcileConfig, gateway: ScriptedGateway) -> Self {
        let pool = guildvote_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("pool");
        guildvote_db::run_migrations(&pool).await.expect("migrations");
        let clock = ManualClock::new(t0());
        let store = Arc::new(VoteStore::with_clock(
            pool,
            StoreConfig {
                lock_wait: Duration::from_millis(200),
                ..StoreConfig::default()
            },
            Arc::new(clock.clone()),
        ));
        let renderer = Arc::new(CountingRenderer::default());
        let gateway = Arc::new(gateway);
        let scheduler = Arc::new(ReconciliationScheduler::new(
            store.clone(),
            renderer.clone(),
            gateway.clone(),
            config,
        ));
        Self {
            store,
            clock,
            renderer,
            gateway,
            scheduler,
        }
    }

    async fn insert_poll(&self, guild_id: i64, poll_id: i64, start: DateTime<Utc>) {
        let settings = VoteSettings::new(1, Duration::from_secs(3600), true, "UTC").unwrap();
        let vote = Vote::new(
            poll_id,
            guild_id,
            900 + guild_id,
            "Lunch",
            "Where?",
            start,
            ["Pizza", "Sushi"],
            settings,
        )
        .unwrap();
        let scope = self.store.lock_scope(guild_id).await.unwrap();
        self.store.insert_vote(&scope, poll_id, vote).await.unwrap();
    }

    /// A second scheduler on the same store, talking to `gateway`.
    fn scheduler_with(
        &self,
        gateway: Arc<dyn Gateway>,
        config: ReconcileConfig,
    ) -> Arc<ReconciliationScheduler> {
        Arc::new(ReconciliationScheduler::new(
            self.store.clone(),
            self.renderer.clone(),
            gateway,
            config,
        ))
    }

    fn renders(&self) -> u32 {
        self.renderer.calls.load(Ordering::SeqCst)
    }

    fn queued_keys(&self) -> Vec<(i64, i64)> {
        self.scheduler
            .queued()
            .iter()
            .map(|entry| (entry.key.guild_id, entry.key.poll_id))
            .collect()
    }
}

#[tokio::test]
async fn test_enqueue_deduplicates_and_extends_timeout() {
    let h = Harness::new(ReconcileConfig::default()).await;
    assert!(h.scheduler.enqueue(1, 5));
    h.clock.advance(ChronoDuration::minutes(5));
    assert!(!h.scheduler.enqueue(1, 5));

    let queued = h.scheduler.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(
        queued[0].timeout,
        t0() + ChronoDuration::minutes(5) + ChronoDuration::hours(1)
    );
}

#[tokio::test]
async fn test_tick_delivers_rendered_text() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();
    h.scheduler.enqueue(1, 5);

    assert_eq!(h.scheduler.tick().await, TickOutcome::Delivered);
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(
        *h.gateway.sent.lock().unwrap(),
        vec![(1, 901, 5, "Lunch (0 answers)".to_string())]
    );
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.scheduler.stats().delivered, 1);
}

#[tokio::test]
async fn test_expired_entry_is_dropped_without_delivery() {
    let config = ReconcileConfig {
        update_timeout: Duration::from_secs(1),
        ..ReconcileConfig::default()
    };
    let h = Harness::new(config).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();
    h.scheduler.enqueue(1, 5);

    h.clock.advance(ChronoDuration::seconds(2));
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.renders(), 0);
    assert_eq!(h.gateway.calls(), 0);
    assert_eq!(h.scheduler.stats().expired, 1);
}

#[tokio::test]
async fn test_retry_gives_up_after_max_tries() {
    let config = ReconcileConfig {
        max_tries: 3,
        retry_interval: Duration::from_secs(30),
        ..ReconcileConfig::default()
    };
    let gateway = ScriptedGateway::failing_with([
        GatewayError::Transient("down".into()),
        GatewayError::RateLimited,
        GatewayError::Transient("down".into()),
    ]);
    let h = Harness::with_gateway(config, gateway).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();
    h.scheduler.enqueue(1, 5);

    assert_eq!(
        h.scheduler.tick().await,
        TickOutcome::Retrying { attempts: 1 }
    );
    // Not due again before the retry pause is over.
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.gateway.calls(), 1);
    assert_eq!(
        h.scheduler.queued()[0].next_try,
        t0() + ChronoDuration::seconds(30)
    );

    h.clock.advance(ChronoDuration::seconds(30));
    assert_eq!(
        h.scheduler.tick().await,
        TickOutcome::Retrying { attempts: 2 }
    );
    h.clock.advance(ChronoDuration::seconds(30));
    assert_eq!(
        h.scheduler.tick().await,
        TickOutcome::Exhausted { attempts: 3 }
    );
    assert_eq!(h.scheduler.pending(), 0);

    h.clock.advance(ChronoDuration::seconds(30));
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.gateway.calls(), 3);
    assert_eq!(h.renders(), 3);

    let stats = h.scheduler.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.delivered, 0);
}

#[tokio::test]
async fn test_retry_is_abandoned_once_timed_out() {
    let config = ReconcileConfig {
        update_timeout: Duration::from_secs(40),
        retry_interval: Duration::from_secs(30),
        ..ReconcileConfig::default()
    };
    let gateway = ScriptedGateway::failing_with([GatewayError::RateLimited]);
    let h = Harness::with_gateway(config, gateway).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();
    h.scheduler.enqueue(1, 5);

    assert_eq!(
        h.scheduler.tick().await,
        TickOutcome::Retrying { attempts: 1 }
    );
    h.clock.advance(ChronoDuration::seconds(45));
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.gateway.calls(), 1);
}

#[tokio::test]
async fn test_unreachable_guild_keeps_entries() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.enqueue(1, 5);

    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.scheduler.pending(), 1);
    assert_eq!(h.gateway.calls(), 0);

    assert_eq!(h.scheduler.on_scope_reachable(1).await.unwrap(), 0);
    assert_eq!(h.scheduler.tick().await, TickOutcome::Delivered);

    h.scheduler.on_scope_unreachable(1);
    assert!(!h.scheduler.is_reachable(1));
    h.scheduler.enqueue(1, 5);
    assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
    assert_eq!(h.scheduler.pending(), 1);
}

#[tokio::test]
async fn test_ineligible_entries_move_to_the_tail() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.insert_poll(2, 1, t0()).await;
    h.insert_poll(2, 2, t0()).await;
    h.scheduler.on_scope_reachable(2).await.unwrap();
    h.scheduler.enqueue(1, 1);
    h.scheduler.enqueue(2, 1);
    h.scheduler.enqueue(2, 2);

    assert_eq!(h.scheduler.tick().await, TickOutcome::Delivered);
    assert_eq!(h.queued_keys(), vec![(2, 2), (1, 1)]);
}

#[tokio::test]
async fn test_missing_poll_and_message_are_dropped() {
    let gateway = ScriptedGateway::failing_with([GatewayError::NotFound]);
    let h = Harness::with_gateway(ReconcileConfig::default(), gateway).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();

    h.scheduler.enqueue(1, 404);
    assert_eq!(h.scheduler.tick().await, TickOutcome::Missing);
    assert_eq!(h.gateway.calls(), 0);
    assert_eq!(h.renders(), 0);

    h.scheduler.enqueue(1, 5);
    assert_eq!(h.scheduler.tick().await, TickOutcome::Missing);
    assert_eq!(h.gateway.calls(), 1);
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.scheduler.stats().missing, 2);
}

#[tokio::test]
async fn test_busy_guild_counts_as_failed_attempt() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();
    h.scheduler.enqueue(1, 5);

    let busy = h.store.lock_scope(1).await.unwrap();
    assert_eq!(
        h.scheduler.tick().await,
        TickOutcome::Retrying { attempts: 1 }
    );
    drop(busy);
    assert_eq!(h.gateway.calls(), 0);
    assert_eq!(h.scheduler.pending(), 1);
}

#[tokio::test]
async fn test_sweep_missed_edits_requeues_unseen_edits() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.insert_poll(1, 5, t0()).await;

    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 1);
    assert_eq!(h.queued_keys(), vec![(1, 5)]);
    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 0);

    // An edit stamped before the previous sweep started, but within the
    // slack, is still found.
    h.clock.set(t0() + ChronoDuration::seconds(100));
    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 0);
    h.clock.set(t0() + ChronoDuration::seconds(70));
    {
        let scope = h.store.lock_scope(1).await.unwrap();
        h.store.cast_votes(&scope, 9, 5, &[1]).await.unwrap();
    }
    h.clock.set(t0() + ChronoDuration::seconds(200));
    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 1);
    assert_eq!(h.scheduler.pending(), 1);
    assert_eq!(h.scheduler.stats().edits_found, 2);
}

#[tokio::test]
async fn test_sweep_expired_votes_applies_retention() {
    let config = ReconcileConfig {
        retention: Duration::from_secs(24 * 60 * 60),
        ..ReconcileConfig::default()
    };
    let h = Harness::new(config).await;
    h.insert_poll(1, 1, t0() - ChronoDuration::days(3)).await;
    h.insert_poll(2, 2, t0() - ChronoDuration::days(3)).await;
    h.insert_poll(1, 3, t0()).await;

    assert_eq!(h.scheduler.sweep_expired_votes().await.unwrap(), 2);
    assert_eq!(h.scheduler.stats().votes_deleted, 2);

    let scope = h.store.lock_scope(1).await.unwrap();
    assert_eq!(
        h.store.list_poll_ids(&scope).await.unwrap(),
        BTreeSet::from([3])
    );
}

#[tokio::test]
async fn test_shutdown_persists_queue_for_next_run() {
    let config = ReconcileConfig::default();
    let h = Harness::new(config.clone()).await;
    h.insert_poll(1, 5, t0()).await;
    h.insert_poll(1, 6, t0()).await;
    h.scheduler.enqueue(1, 5);
    h.scheduler.enqueue(1, 6);
    h.scheduler.enqueue(2, 7);

    assert_eq!(h.scheduler.shutdown().await.unwrap(), 3);
    assert_eq!(h.scheduler.pending(), 0);

    let next = ReconciliationScheduler::new(
        h.store.clone(),
        h.renderer.clone(),
        h.gateway.clone(),
        config,
    );
    assert_eq!(next.pending(), 0);
    assert_eq!(next.on_scope_reachable(1).await.unwrap(), 2);
    let keys: Vec<PollKey> = next.queued().iter().map(|entry| entry.key).collect();
    assert_eq!(keys, vec![PollKey::new(1, 5), PollKey::new(1, 6)]);
    assert_eq!(next.tick().await, TickOutcome::Delivered);
    // Restoring twice finds nothing new.
    assert_eq!(next.on_scope_reachable(1).await.unwrap(), 0);
}

#[tokio::test]
async fn test_worker_delivers_and_stops() {
    let config = ReconcileConfig {
        update_interval: Duration::from_millis(10),
        ..ReconcileConfig::default()
    };
    let h = Harness::new(config).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();
    h.scheduler.enqueue(1, 5);
    h.scheduler.start();

    let delivered = async {
        while h.gateway.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), delivered)
        .await
        .expect("worker delivered the refresh");

    assert_eq!(h.scheduler.shutdown().await.unwrap(), 0);
    let calls = h.gateway.calls();
    h.scheduler.enqueue(1, 5);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.gateway.calls(), calls);
}

#[tokio::test]
async fn test_shutdown_of_idle_worker_saves_queue() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.scheduler.start();
    h.scheduler.enqueue(3, 9);
    assert_eq!(h.scheduler.shutdown().await.unwrap(), 1);
    assert_eq!(
        h.store.load_and_clear_queue_snapshot(3).await.unwrap(),
        vec![PollKey::new(3, 9)]
    );
}

#[tokio::test]
async fn test_unanswered_gateway_call_is_retried() {
    let config = ReconcileConfig {
        gateway_timeout: Duration::from_millis(50),
        ..ReconcileConfig::default()
    };
    let h = Harness::new(config.clone()).await;
    h.insert_poll(1, 5, t0()).await;
    let gateway = Arc::new(HangingGateway::default());
    let scheduler = h.scheduler_with(gateway.clone(), config);
    scheduler.on_scope_reachable(1).await.unwrap();
    scheduler.enqueue(1, 5);

    let outcome = tokio::time::timeout(Duration::from_secs(2), scheduler.tick())
        .await
        .expect("tick gave up on the gateway");
    assert_eq!(outcome, TickOutcome::Retrying { attempts: 1 });
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending(), 1);
}

#[tokio::test]
async fn test_shutdown_saves_refresh_stuck_in_gateway() {
    let config = ReconcileConfig {
        update_interval: Duration::from_millis(10),
        gateway_timeout: Duration::from_secs(60),
        shutdown_grace: Duration::from_millis(100),
        ..ReconcileConfig::default()
    };
    let h = Harness::new(config.clone()).await;
    h.insert_poll(1, 5, t0()).await;
    h.insert_poll(1, 6, t0()).await;
    let gateway = Arc::new(HangingGateway::default());
    let scheduler = h.scheduler_with(gateway.clone(), config);
    scheduler.on_scope_reachable(1).await.unwrap();
    scheduler.enqueue(1, 5);
    scheduler.enqueue(1, 6);
    scheduler.start();

    let stuck = async {
        while gateway.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), stuck)
        .await
        .expect("worker reached the gateway");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending(), 1);

    assert_eq!(scheduler.shutdown().await.unwrap(), 2);
    assert_eq!(
        h.store.load_and_clear_queue_snapshot(1).await.unwrap(),
        vec![PollKey::new(1, 5), PollKey::new(1, 6)]
    );
}

#[tokio::test]
async fn test_delivered_edit_is_not_swept_again() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.insert_poll(1, 5, t0()).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();
    h.scheduler.enqueue(1, 5);
    assert_eq!(h.scheduler.tick().await, TickOutcome::Delivered);

    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 0);
    assert_eq!(h.scheduler.pending(), 0);

    h.clock.advance(ChronoDuration::seconds(5));
    {
        let scope = h.store.lock_scope(1).await.unwrap();
        h.store.cast_votes(&scope, 9, 5, &[2]).await.unwrap();
    }
    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 1);
    assert_eq!(h.queued_keys(), vec![(1, 5)]);
}

#[tokio::test]
async fn test_ended_poll_gets_one_final_refresh() {
    let h = Harness::new(ReconcileConfig::default()).await;
    h.insert_poll(1, 5, t0()).await;
    h.insert_poll(1, 6, t0() + ChronoDuration::hours(5)).await;
    h.scheduler.on_scope_reachable(1).await.unwrap();

    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 2);
    while h.scheduler.tick().await != TickOutcome::Idle {}
    assert_eq!(h.gateway.calls(), 2);

    // Poll 5 ran for one hour; poll 6 is still open.
    h.clock.advance(ChronoDuration::hours(2));
    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 1);
    assert_eq!(h.queued_keys(), vec![(1, 5)]);
    assert_eq!(h.scheduler.tick().await, TickOutcome::Delivered);
    assert_eq!(h.scheduler.stats().final_refreshes, 1);

    h.clock.advance(ChronoDuration::minutes(10));
    assert_eq!(h.scheduler.sweep_missed_edits().await.unwrap(), 0);
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.gateway.calls(), 3);
}
