use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::Instrument;
use uuid::Uuid;

use super::state::{CycleOutcome, PollPhase, PollPolicy, PollState};
use crate::api::{DetailFetcher, FetchOutcome, ListingFetcher, SearchParams};
use crate::core::{HealthChecker, MonitorError, MonitorMetrics, MonitorResult};
use crate::listing::{ChangeKind, ClassifiedListing, ListingNormalizer};
use crate::monitoring::{ChangeDetector, Classification, CycleStats, HistoryRecord, HistoryStore};
use crate::notify::NotificationDispatcher;

/// What one cycle did, for logs, metrics and the `cycle_stats` table.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub total_found: usize,
    pub new_found: usize,
    pub updated_found: usize,
    pub unchanged_found: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed_pages: usize,
    /// Work items handed to the dispatcher, retries included.
    pub attempted: usize,
    pub notified: usize,
    pub delivery_errors: usize,
    pub baseline: bool,
}

impl CycleReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: now,
            outcome: CycleOutcome::Success,
            total_found: 0,
            new_found: 0,
            updated_found: 0,
            unchanged_found: 0,
            duplicates: 0,
            rejected: 0,
            failed_pages: 0,
            attempted: 0,
            notified: 0,
            delivery_errors: 0,
            baseline: false,
        }
    }

    fn finish(mut self, outcome: CycleOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }

    pub fn to_stats(&self) -> CycleStats {
        CycleStats {
            cycle_id: self.cycle_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome.as_str().to_string(),
            total_found: self.total_found as i64,
            new_found: self.new_found as i64,
            updated_found: self.updated_found as i64,
            unchanged_found: self.unchanged_found as i64,
            notified: self.notified as i64,
            delivery_errors: self.delivery_errors as i64,
            failed_pages: self.failed_pages as i64,
        }
    }
}

/// Resolves once shutdown is signalled; never if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Drives fetch → classify → persist → notify, one cycle at a time.
pub struct PollScheduler {
    fetcher: Arc<dyn ListingFetcher>,
    normalizer: Arc<dyn ListingNormalizer>,
    store: Arc<dyn HistoryStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    detector: ChangeDetector,
    params: SearchParams,
    policy: PollPolicy,
    health: HealthChecker,
    metrics: Option<MonitorMetrics>,
    detail_fetcher: Option<Arc<dyn DetailFetcher>>,
    in_flight: Mutex<()>,
}

impl PollScheduler {
    pub fn new(
        fetcher: Arc<dyn ListingFetcher>,
        normalizer: Arc<dyn ListingNormalizer>,
        store: Arc<dyn HistoryStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        params: SearchParams,
        policy: PollPolicy,
        health: HealthChecker,
    ) -> Self {
        Self {
            fetcher,
            normalizer,
            store,
            dispatcher,
            detector: ChangeDetector::new(),
            params,
            policy,
            health,
            metrics: None,
            detail_fetcher: None,
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_metrics(mut self, metrics: MonitorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Listings are enriched from their own page before delivery.
    pub fn with_detail_fetcher(mut self, detail_fetcher: Arc<dyn DetailFetcher>) -> Self {
        self.detail_fetcher = Some(detail_fetcher);
        self
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Runs cycles until shutdown is signalled. Returns the final state.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PollState {
        tracing::info!(
            "🚀 Poll scheduler started (interval {:?}, jitter {:?}-{:?}, backoff ceiling {:?})",
            self.policy.interval,
            self.policy.jitter_min,
            self.policy.jitter_max,
            self.policy.backoff_ceiling
        );

        let mut state = PollState::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (next, report) = self.run_cycle(state, &shutdown).await;
            state = next;
            if report.outcome == CycleOutcome::Aborted {
                break;
            }

            let delay = state.next_delay(&self.policy);
            if state.in_backoff() {
                tracing::warn!(
                    "⏳ Backing off: next check in {:?} ({} consecutive failures)",
                    delay,
                    state.consecutive_failures
                );
            } else {
                tracing::info!("💤 Next check in {:?}", delay);
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        tracing::info!("🛑 Poll scheduler stopped after {} cycles", state.cycles_run);
        state
    }

    /// One full cycle. At most one runs at a time; a concurrent call is
    /// reported as skipped and leaves the state untouched.
    pub async fn run_cycle(
        &self,
        state: PollState,
        shutdown: &watch::Receiver<bool>,
    ) -> (PollState, CycleReport) {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::warn!("Check cycle already running, skipping");
            return (state, CycleReport::begin().finish(CycleOutcome::Skipped));
        };

        let report = CycleReport::begin();
        let span = tracing::info_span!("cycle", id = %report.cycle_id);
        let (state, report) = self
            .execute(state, report, shutdown.clone())
            .instrument(span)
            .await;

        let state = state.complete(report.outcome, report.finished_at);
        self.after_cycle(&state, &report).await;

        (state, report)
    }

    async fn execute(
        &self,
        state: PollState,
        mut report: CycleReport,
        mut shutdown: watch::Receiver<bool>,
    ) -> (PollState, CycleReport) {
        // FETCHING
        let state = state.enter(PollPhase::Fetching);
        let fetched = tokio::select! {
            result = self.fetcher.fetch(&self.params) => result,
            _ = shutdown_requested(&mut shutdown) => {
                tracing::info!("Shutdown during fetch, abandoning cycle");
                return (state, report.finish(CycleOutcome::Aborted));
            }
        };

        let outcome = match fetched {
            Ok(outcome) if !outcome.is_total_failure() => outcome,
            Ok(outcome) => {
                let reasons: Vec<_> = outcome.failures.iter().map(|f| f.reason.as_str()).collect();
                tracing::error!(
                    "❌ Fetch failed on all {} pages: {}",
                    outcome.pages_attempted,
                    reasons.join("; ")
                );
                report.failed_pages = outcome.failures.len();
                return (state, report.finish(CycleOutcome::FetchFailed));
            }
            Err(e) => {
                tracing::error!("❌ Fetch failed: {}", e);
                return (state, report.finish(CycleOutcome::FetchFailed));
            }
        };
        let degraded_fetch = self.log_fetch(&outcome, &mut report);

        // CLASSIFYING
        let state = state.enter(PollPhase::Classifying);
        let (listings, rejected) = self.normalizer.normalize_all(&outcome.records);
        report.rejected = rejected;

        let keys: Vec<String> = listings.iter().map(|l| l.identity_key.clone()).collect();
        let snapshot = match self.store.get_many(&keys).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("❌ History lookup failed: {}", e);
                return (state, report.finish(CycleOutcome::PersistFailed));
            }
        };
        let classification = self.detector.classify(listings, &snapshot);
        self.tally(&classification, &mut report);

        if *shutdown.borrow() {
            tracing::info!("Shutdown before persisting, abandoning cycle");
            return (state, report.finish(CycleOutcome::Aborted));
        }

        // PERSISTING
        let state = state.enter(PollPhase::Persisting);
        let baseline = self.policy.baseline_on_empty && self.history_is_empty().await;
        report.baseline = baseline;

        let persisted = self.persist(&classification, &snapshot, baseline).await;
        if let Err(e) = persisted {
            tracing::error!(
                "❌ Persisting {} listings failed, cycle discarded: {}",
                classification.entries.len(),
                e
            );
            return (state, report.finish(CycleOutcome::PersistFailed));
        }

        if baseline {
            tracing::info!(
                "📥 Baseline recorded: {} listings marked as already seen",
                classification.entries.len()
            );
            return (state, report.finish(CycleOutcome::Success));
        }

        // NOTIFYING
        let state = state.enter(PollPhase::Notifying);
        let work = match self.notification_work(&classification, &snapshot).await {
            Ok(work) => work,
            Err(e) => {
                // current-cycle items still go out; older retries wait for the next cycle
                tracing::warn!("⚠️  Could not load pending notifications: {}", e);
                self.current_work(&classification, &snapshot)
            }
        };

        for entry in &work {
            if *shutdown.borrow() {
                tracing::info!(
                    "Shutdown during notification, {} listings left for next run",
                    work.len() - report.attempted
                );
                return (state, report.finish(CycleOutcome::Aborted));
            }

            report.attempted += 1;
            if self.notify(entry).await {
                report.notified += 1;
            } else {
                report.delivery_errors += 1;
            }
        }

        let outcome = if degraded_fetch || report.delivery_errors > 0 {
            CycleOutcome::Degraded
        } else {
            CycleOutcome::Success
        };

        tracing::info!(
            "✅ Cycle done: found={}, new={}, updated={}, unchanged={}, notified={}/{}",
            report.total_found,
            report.new_found,
            report.updated_found,
            report.unchanged_found,
            report.notified,
            report.attempted
        );

        (state, report.finish(outcome))
    }

    fn log_fetch(&self, outcome: &FetchOutcome, report: &mut CycleReport) -> bool {
        report.failed_pages = outcome.failures.len();
        if outcome.failures.is_empty() {
            tracing::debug!(
                "📡 Fetched {} records from {} pages",
                outcome.records.len(),
                outcome.pages_attempted
            );
            return false;
        }

        for failure in &outcome.failures {
            tracing::warn!("⚠️  Page {} unreachable ({}): {}", failure.page, failure.url, failure.reason);
        }
        tracing::warn!(
            "⚠️  Degraded fetch: {}/{} pages failed, continuing with {} records",
            outcome.failures.len(),
            outcome.pages_attempted,
            outcome.records.len()
        );
        true
    }

    fn tally(&self, classification: &Classification, report: &mut CycleReport) {
        report.total_found = classification.entries.len();
        report.duplicates = classification.duplicates;
        report.new_found = classification.count(ChangeKind::New);
        report.updated_found = classification.count(ChangeKind::Updated);
        report.unchanged_found = classification.count(ChangeKind::Unchanged);

        if let Some(metrics) = &self.metrics {
            metrics.record_classified("new", report.new_found);
            metrics.record_classified("updated", report.updated_found);
            metrics.record_classified("unchanged", report.unchanged_found);
        }
    }

    async fn history_is_empty(&self) -> bool {
        match self.store.count().await {
            Ok(count) => count == 0,
            Err(e) => {
                tracing::warn!("Could not count history records: {}", e);
                false
            }
        }
    }

    async fn persist(
        &self,
        classification: &Classification,
        snapshot: &HashMap<String, HistoryRecord>,
        baseline: bool,
    ) -> MonitorResult<()> {
        let now = Utc::now();
        let records = classification
            .entries
            .iter()
            .map(|entry| {
                HistoryRecord::observe(
                    &entry.listing,
                    snapshot.get(entry.identity_key()),
                    now,
                    baseline,
                )
            })
            .collect::<MonitorResult<Vec<_>>>()?;

        self.store.upsert_batch(&records).await
    }

    /// Detector output joined with everything still awaiting delivery.
    ///
    /// Order: NEW/UPDATED from this fetch, then unchanged listings whose
    /// earlier delivery never succeeded, then older undelivered records that
    /// did not show up in this fetch. Capped by `max_new_per_cycle`.
    async fn notification_work(
        &self,
        classification: &Classification,
        snapshot: &HashMap<String, HistoryRecord>,
    ) -> MonitorResult<Vec<ClassifiedListing>> {
        let mut work = self.current_work(classification, snapshot);
        let limit = self.policy.work_limit();
        if limit.is_some_and(|l| work.len() >= l) {
            return Ok(work);
        }

        let mut queued: HashSet<String> = classification
            .entries
            .iter()
            .map(|e| e.identity_key().to_string())
            .collect();

        // current-cycle keys come back as well, so over-fetch by that many
        let pending_limit = limit.map(|l| l - work.len() + queued.len());
        let pending = self.store.pending_notifications(pending_limit).await?;

        for record in pending {
            if limit.is_some_and(|l| work.len() >= l) {
                break;
            }
            if !queued.insert(record.identity_key.clone()) {
                continue;
            }
            match record.listing() {
                Ok(listing) => work.push(ClassifiedListing::new(listing, record.pending_kind())),
                Err(e) => tracing::warn!(
                    "Stored payload for {} is unreadable, skipping retry: {}",
                    record.identity_key,
                    e
                ),
            }
        }

        Ok(work)
    }

    fn current_work(
        &self,
        classification: &Classification,
        snapshot: &HashMap<String, HistoryRecord>,
    ) -> Vec<ClassifiedListing> {
        let mut work: Vec<ClassifiedListing> = classification.notifiable().cloned().collect();

        // retries keep the kind they were first announced with
        let retries = classification
            .entries
            .iter()
            .filter(|e| e.kind == ChangeKind::Unchanged)
            .filter_map(|e| {
                snapshot
                    .get(e.identity_key())
                    .filter(|r| !r.notified)
                    .map(|r| ClassifiedListing::new(e.listing.clone(), r.pending_kind()))
            });
        work.extend(retries);

        if let Some(limit) = self.policy.work_limit() {
            if work.len() > limit {
                tracing::info!(
                    "Hit per-cycle limit ({}), {} listings deferred",
                    limit,
                    work.len() - limit
                );
                work.truncate(limit);
            }
        }
        work
    }

    /// Adds detail-page fields; on failure the card data is sent as is.
    async fn enrich(&self, entry: &ClassifiedListing) -> ClassifiedListing {
        let Some(detail_fetcher) = &self.detail_fetcher else {
            return entry.clone();
        };

        match detail_fetcher.fetch_details(&entry.listing).await {
            Ok(details) => entry.clone().with_details(details),
            Err(e) => {
                tracing::warn!(
                    "Details for {} unavailable, sending search result data: {}",
                    entry.identity_key(),
                    e
                );
                entry.clone()
            }
        }
    }

    /// Delivers one listing; true once delivered and flagged.
    async fn notify(&self, entry: &ClassifiedListing) -> bool {
        let entry = &self.enrich(entry).await;
        let delivery = tokio::time::timeout(
            self.policy.delivery_timeout,
            self.dispatcher.deliver(entry),
        )
        .await
        .unwrap_or_else(|_| {
            Err(MonitorError::Timeout {
                operation: format!("delivery of {}", entry.identity_key()),
                secs: self.policy.delivery_timeout.as_secs(),
            })
        });

        if let Err(e) = delivery {
            tracing::warn!(
                "📭 Delivery of {} failed, will retry next cycle: {}",
                entry.identity_key(),
                e
            );
            self.record_notification("failed");
            return false;
        }

        self.record_notification("delivered");
        match self
            .store
            .mark_notified(entry.identity_key(), entry.content_hash())
            .await
        {
            Ok(true) => {
                tracing::info!("📨 Notified {} listing {}", entry.kind, entry.identity_key());
            }
            Ok(false) => {
                tracing::debug!(
                    "Listing {} changed again before delivery finished",
                    entry.identity_key()
                );
            }
            Err(e) => {
                // delivered but not flagged: the next cycle sends it again
                tracing::error!(
                    "❌ Could not flag {} as notified: {}",
                    entry.identity_key(),
                    e
                );
            }
        }
        true
    }

    /// Component flags on the health endpoint reflect the last cycle that
    /// reached each component.
    async fn update_components(&self, report: &CycleReport) {
        if matches!(report.outcome, CycleOutcome::Skipped | CycleOutcome::Aborted) {
            return;
        }
        self.health
            .update_component("fetcher", report.outcome != CycleOutcome::FetchFailed)
            .await;
        if report.outcome != CycleOutcome::FetchFailed {
            self.health
                .update_component("history_store", report.outcome != CycleOutcome::PersistFailed)
                .await;
        }
        if report.attempted > 0 {
            self.health
                .update_component("dispatcher", report.delivery_errors == 0)
                .await;
        }
    }

    fn record_notification(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_notification(outcome);
        }
    }

    async fn after_cycle(&self, state: &PollState, report: &CycleReport) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(report.outcome.as_str());
            metrics.set_consecutive_failures(state.consecutive_failures);
        }

        match report.outcome {
            CycleOutcome::Success => self.health.record_success().await,
            outcome if outcome.is_failure() => {
                let newly_degraded = self
                    .health
                    .record_failure(state.consecutive_failures, outcome.as_str())
                    .await;
                if newly_degraded {
                    tracing::error!(
                        "🛑 {} consecutive failed cycles, monitor is degraded",
                        state.consecutive_failures
                    );
                }
            }
            _ => {}
        }
        self.update_components(report).await;

        if let Err(e) = self.store.record_cycle(&report.to_stats()).await {
            tracing::warn!("Could not record cycle stats: {}", e);
        }
    }
}
