use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use classifieds_monitor::api::{FetchOutcome, ListingFetcher, PageFailure, SearchParams};
use classifieds_monitor::core::{HealthChecker, MonitorError, MonitorResult};
use classifieds_monitor::listing::{ChangeKind, ClassifiedListing, RawRecord, SearchResultNormalizer};
use classifieds_monitor::monitoring::{CycleStats, HistoryDatabase, HistoryRecord, HistoryStore};
use classifieds_monitor::notify::NotificationDispatcher;
use classifieds_monitor::scheduler::{CycleOutcome, PollPolicy, PollScheduler, PollState};

/// Serves queued fetch results in order, repeating the last one.
struct ScriptedFetcher {
    script: Mutex<VecDeque<MonitorResult<FetchOutcome>>>,
    last: Mutex<Option<FetchOutcome>>,
}

impl ScriptedFetcher {
    fn new(script: Vec<MonitorResult<FetchOutcome>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ListingFetcher for ScriptedFetcher {
    async fn fetch(&self, _params: &SearchParams) -> MonitorResult<FetchOutcome> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(outcome)) => {
                *self.last.lock().unwrap() = Some(outcome.clone());
                Ok(outcome)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone().unwrap_or_default()),
        }
    }
}

/// Signals shutdown as soon as the fetch starts, then never finishes.
struct StallingFetcher {
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl ListingFetcher for StallingFetcher {
    async fn fetch(&self, _params: &SearchParams) -> MonitorResult<FetchOutcome> {
        self.shutdown.send_replace(true);
        std::future::pending().await
    }
}

/// Records what was delivered; keys in `failing` are rejected.
#[derive(Default)]
struct RecordingDispatcher {
    delivered: Mutex<Vec<(String, ChangeKind, String)>>,
    failing: Mutex<HashSet<String>>,
    /// Signalled after the next successful delivery.
    stop_after: Mutex<Option<watch::Sender<bool>>>,
}

impl RecordingDispatcher {
    fn stop_after_next_delivery(&self, shutdown: watch::Sender<bool>) {
        *self.stop_after.lock().unwrap() = Some(shutdown);
    }

    fn fail_for(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn delivered(&self) -> Vec<(String, ChangeKind, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn deliver(&self, listing: &ClassifiedListing) -> MonitorResult<()> {
        if self.failing.lock().unwrap().contains(listing.identity_key()) {
            return Err(MonitorError::Delivery("chat unreachable".to_string()));
        }
        self.delivered.lock().unwrap().push((
            listing.identity_key().to_string(),
            listing.kind,
            listing.listing.title.clone(),
        ));
        if let Some(shutdown) = self.stop_after.lock().unwrap().take() {
            shutdown.send_replace(true);
        }
        Ok(())
    }
}

/// History store whose batch writes can be switched off.
struct FlakyStore {
    inner: HistoryDatabase,
    writes_fail: AtomicBool,
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn get(&self, identity_key: &str) -> MonitorResult<Option<HistoryRecord>> {
        self.inner.get(identity_key).await
    }

    async fn get_many(&self, identity_keys: &[String]) -> MonitorResult<HashMap<String, HistoryRecord>> {
        self.inner.get_many(identity_keys).await
    }

    async fn upsert_batch(&self, records: &[HistoryRecord]) -> MonitorResult<()> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(MonitorError::Persistence(sqlx::Error::PoolTimedOut));
        }
        self.inner.upsert_batch(records).await
    }

    async fn mark_notified(&self, identity_key: &str, content_hash: &str) -> MonitorResult<bool> {
        self.inner.mark_notified(identity_key, content_hash).await
    }

    async fn pending_notifications(&self, limit: Option<usize>) -> MonitorResult<Vec<HistoryRecord>> {
        self.inner.pending_notifications(limit).await
    }

    async fn count(&self) -> MonitorResult<u64> {
        self.inner.count().await
    }

    async fn record_cycle(&self, stats: &CycleStats) -> MonitorResult<()> {
        self.inner.record_cycle(stats).await
    }
}

fn card(id: &str, title: &str, price: &str) -> RawRecord {
    RawRecord::new(1)
        .with("id", id)
        .with("title", title)
        .with("price", price)
        .with("location", "09111 Chemnitz")
        .with("url", format!("/s-anzeige/{}/{}-216-3869", title.to_lowercase(), id))
}

fn page(records: Vec<RawRecord>) -> MonitorResult<FetchOutcome> {
    Ok(FetchOutcome {
        records,
        failures: Vec::new(),
        pages_attempted: 1,
    })
}

fn policy() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(20),
        jitter_min: Duration::ZERO,
        jitter_max: Duration::ZERO,
        backoff_base: Duration::from_millis(10),
        backoff_ceiling: Duration::from_millis(40),
        max_consecutive_failures: 2,
        max_new_per_cycle: 0,
        delivery_timeout: Duration::from_secs(2),
        baseline_on_empty: false,
    }
}

fn params() -> SearchParams {
    SearchParams {
        url: "https://www.kleinanzeigen.de/s-autos/chemnitz/c216l3869r150".to_string(),
        max_pages: 1,
        max_listings_per_page: 50,
    }
}

fn scheduler(
    fetcher: ScriptedFetcher,
    store: Arc<dyn HistoryStore>,
    dispatcher: Arc<RecordingDispatcher>,
    health: HealthChecker,
) -> PollScheduler {
    PollScheduler::new(
        Arc::new(fetcher),
        Arc::new(SearchResultNormalizer::default()),
        store,
        dispatcher,
        params(),
        policy(),
        health,
    )
}

fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn test_new_then_unchanged_then_updated() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![
        page(vec![card("100", "Golf", "12.500 €")]),
        page(vec![card("100", "Golf", "12.500 €")]),
        page(vec![card("100", "Golf", "11.900 €")]),
    ]);
    let scheduler = scheduler(fetcher, store.clone(), dispatcher.clone(), HealthChecker::new(2));
    let shutdown = no_shutdown();

    let (state, first) = scheduler.run_cycle(PollState::default(), &shutdown).await;
    let (state, second) = scheduler.run_cycle(state, &shutdown).await;
    let (_, third) = scheduler.run_cycle(state, &shutdown).await;

    assert_eq!((first.new_found, first.notified), (1, 1));
    assert_eq!((second.unchanged_found, second.attempted), (1, 0));
    assert_eq!((third.updated_found, third.notified), (1, 1));

    let kinds: Vec<_> = dispatcher.delivered().into_iter().map(|(_, k, _)| k).collect();
    assert_eq!(kinds, vec![ChangeKind::New, ChangeKind::Updated]);

    let record = store.get("100").await.unwrap().unwrap();
    assert!(record.notified);
    assert_eq!(record.listing().unwrap().price.as_deref(), Some("11.900 €"));
}

#[tokio::test]
async fn test_duplicates_in_one_fetch_notify_once() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![page(vec![
        card("7", "Polo", "4.000 €"),
        card("8", "Corsa", "3.500 €"),
        card("7", "Polo", "4.200 €"),
    ])]);
    let scheduler = scheduler(fetcher, store.clone(), dispatcher.clone(), HealthChecker::new(2));

    let (_, report) = scheduler.run_cycle(PollState::default(), &no_shutdown()).await;

    assert_eq!(report.duplicates, 1);
    assert_eq!(report.new_found, 2);
    let delivered = dispatcher.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(store.get("7").await.unwrap().unwrap().listing().unwrap().price.as_deref(), Some("4.000 €"));
}

#[tokio::test]
async fn test_two_updates_in_a_row_are_both_notified() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![
        page(vec![card("1", "Astra", "5.000 €")]),
        page(vec![card("1", "Astra", "4.800 €")]),
        page(vec![card("1", "Astra", "4.500 €")]),
    ]);
    let scheduler = scheduler(fetcher, store, dispatcher.clone(), HealthChecker::new(2));
    let shutdown = no_shutdown();

    let mut state = PollState::default();
    for _ in 0..3 {
        state = scheduler.run_cycle(state, &shutdown).await.0;
    }

    let kinds: Vec<_> = dispatcher.delivered().into_iter().map(|(_, k, _)| k).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::New, ChangeKind::Updated, ChangeKind::Updated]
    );
}

#[tokio::test]
async fn test_undelivered_listing_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let path = path.to_str().unwrap();

    // first process: delivery fails, then the process goes away
    {
        let store = Arc::new(HistoryDatabase::new(path).await.unwrap());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        dispatcher.fail_for("55");
        let fetcher = ScriptedFetcher::new(vec![page(vec![card("55", "Fiesta", "2.900 €")])]);
        let scheduler = scheduler(fetcher, store.clone(), dispatcher.clone(), HealthChecker::new(2));

        let (_, report) = scheduler.run_cycle(PollState::default(), &no_shutdown()).await;
        assert_eq!(report.outcome, CycleOutcome::Degraded);
        assert!(dispatcher.delivered().is_empty());
        store.close().await;
    }

    // second process: the listing dropped out of the feed but is still owed
    let store = Arc::new(HistoryDatabase::new(path).await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![page(vec![card("56", "Ka", "1.500 €")])]);
    let scheduler = scheduler(fetcher, store.clone(), dispatcher.clone(), HealthChecker::new(2));

    let (_, report) = scheduler.run_cycle(PollState::default(), &no_shutdown()).await;

    assert_eq!(report.outcome, CycleOutcome::Success);
    let keys: Vec<_> = dispatcher.delivered().into_iter().map(|(k, _, _)| k).collect();
    assert_eq!(keys, vec!["56".to_string(), "55".to_string()]);
    assert!(store.pending_notifications(Some(10)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dispatcher_outage_recovers_without_duplicates() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    dispatcher.fail_for("1");
    let fetcher = ScriptedFetcher::new(vec![page(vec![
        card("1", "Golf", "9.000 €"),
        card("2", "Polo", "6.000 €"),
    ])]);
    let scheduler = scheduler(fetcher, store, dispatcher.clone(), HealthChecker::new(2));
    let shutdown = no_shutdown();

    let (state, first) = scheduler.run_cycle(PollState::default(), &shutdown).await;
    assert_eq!((first.notified, first.delivery_errors), (1, 1));

    dispatcher.recover();
    let (state, second) = scheduler.run_cycle(state, &shutdown).await;
    assert_eq!(second.notified, 1);

    let (_, third) = scheduler.run_cycle(state, &shutdown).await;
    assert_eq!(third.attempted, 0);

    let keys: Vec<_> = dispatcher.delivered().into_iter().map(|(k, _, _)| k).collect();
    assert_eq!(keys, vec!["2".to_string(), "1".to_string()]);
}

#[tokio::test]
async fn test_persistence_failure_suppresses_notifications_and_backs_off() {
    let store = Arc::new(FlakyStore {
        inner: HistoryDatabase::in_memory().await.unwrap(),
        writes_fail: AtomicBool::new(true),
    });
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let health = HealthChecker::new(2);
    let fetcher = ScriptedFetcher::new(vec![page(vec![card("9", "Up", "7.000 €")])]);
    let scheduler = scheduler(fetcher, store.clone(), dispatcher.clone(), health.clone());
    let shutdown = no_shutdown();

    let mut state = PollState::default();
    for _ in 0..3 {
        let (next, report) = scheduler.run_cycle(state, &shutdown).await;
        assert_eq!(report.outcome, CycleOutcome::PersistFailed);
        state = next;
    }

    assert!(dispatcher.delivered().is_empty());
    assert!(state.in_backoff());
    assert!(state.exceeds_retry_ceiling(scheduler.policy()));
    assert!(health.is_degraded().await);
    assert_eq!(store.count().await.unwrap(), 0);

    store.writes_fail.store(false, Ordering::SeqCst);
    let (state, report) = scheduler.run_cycle(state, &shutdown).await;
    assert_eq!(report.outcome, CycleOutcome::Success);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(dispatcher.delivered().len(), 1);
    assert!(!health.is_degraded().await);
}

#[tokio::test]
async fn test_partial_fetch_is_degraded_but_processed() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![Ok(FetchOutcome {
        records: vec![card("3", "Fabia", "3.300 €")],
        failures: vec![PageFailure {
            page: 2,
            url: "https://www.kleinanzeigen.de/s-autos/chemnitz/seite:2/c216l3869r150".to_string(),
            reason: "timed out".to_string(),
        }],
        pages_attempted: 2,
    })]);
    let scheduler = scheduler(fetcher, store.clone(), dispatcher.clone(), HealthChecker::new(2));

    let (state, report) = scheduler.run_cycle(PollState::default(), &no_shutdown()).await;

    assert_eq!(report.outcome, CycleOutcome::Degraded);
    assert_eq!(report.failed_pages, 1);
    assert_eq!(dispatcher.delivered().len(), 1);
    assert!(!state.in_backoff());
    assert_eq!(store.get_last_cycle().await.unwrap().unwrap().outcome, "degraded");
}

#[tokio::test]
async fn test_fetch_error_leaves_history_untouched() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![
        page(vec![card("1", "Golf", "9.000 €")]),
        Err(MonitorError::Blocked("403 Forbidden".to_string())),
    ]);
    let scheduler = scheduler(fetcher, store.clone(), dispatcher, HealthChecker::new(2));
    let shutdown = no_shutdown();

    let (state, _) = scheduler.run_cycle(PollState::default(), &shutdown).await;
    let before = store.get("1").await.unwrap().unwrap();

    let (state, report) = scheduler.run_cycle(state, &shutdown).await;
    assert_eq!(report.outcome, CycleOutcome::FetchFailed);
    assert_eq!(state.consecutive_failures, 1);
    assert_eq!(store.get("1").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![page(vec![card("1", "Golf", "9.000 €")])]);
    let scheduler = Arc::new(scheduler(fetcher, store, dispatcher.clone(), HealthChecker::new(2)));

    let (tx, rx) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(rx).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(true).unwrap();

    let state = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("scheduler stops after shutdown")
        .unwrap();

    assert!(state.cycles_run >= 2);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(dispatcher.delivered().len(), 1);
}

#[tokio::test]
async fn test_shutdown_during_fetch_writes_nothing() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (tx, rx) = watch::channel(false);
    let scheduler = PollScheduler::new(
        Arc::new(StallingFetcher { shutdown: tx }),
        Arc::new(SearchResultNormalizer::default()),
        store.clone(),
        dispatcher.clone(),
        params(),
        policy(),
        HealthChecker::new(2),
    );

    let (state, report) = tokio::time::timeout(
        Duration::from_secs(2),
        scheduler.run_cycle(PollState::default(), &rx),
    )
    .await
    .expect("fetch was not abandoned on shutdown");

    assert_eq!(report.outcome, CycleOutcome::Aborted);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(dispatcher.delivered().is_empty());
}

#[tokio::test]
async fn test_shutdown_between_deliveries_leaves_rest_for_next_run() {
    let store = Arc::new(HistoryDatabase::in_memory().await.unwrap());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let fetcher = ScriptedFetcher::new(vec![page(vec![
        card("1", "Golf", "9.000 €"),
        card("2", "Polo", "6.000 €"),
    ])]);
    let scheduler = scheduler(fetcher, store.clone(), dispatcher.clone(), HealthChecker::new(2));

    let (tx, rx) = watch::channel(false);
    dispatcher.stop_after_next_delivery(tx);
    let (state, report) = scheduler.run_cycle(PollState::default(), &rx).await;

    assert_eq!(report.outcome, CycleOutcome::Aborted);
    assert_eq!((report.new_found, report.attempted), (2, 1));
    assert!(store.get("1").await.unwrap().unwrap().notified);
    assert!(!store.get("2").await.unwrap().unwrap().notified);

    // next run
    let (_, report) = scheduler.run_cycle(state, &no_shutdown()).await;
    assert_eq!(report.outcome, CycleOutcome::Success);
    assert_eq!(report.notified, 1);
    assert!(store.get("2").await.unwrap().unwrap().notified);

    let delivered: Vec<_> = dispatcher
        .delivered()
        .into_iter()
        .map(|(key, kind, _)| (key, kind))
        .collect();
    assert_eq!(
        delivered,
        vec![
            ("1".to_string(), ChangeKind::New),
            ("2".to_string(), ChangeKind::New),
        ]
    );
}
