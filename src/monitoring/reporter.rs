use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::database::{CycleStats, HistoryDatabase, HistoryStatistics};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub statistics: HistoryStatistics,
    pub last_cycle: Option<CycleStats>,
}

pub struct CycleReporter {
    database: Arc<HistoryDatabase>,
}

impl CycleReporter {
    pub fn new(database: Arc<HistoryDatabase>) -> Self {
        Self { database }
    }

    pub async fn generate_summary(&self) -> Result<MonitoringReport> {
        let statistics = self.database.get_statistics().await?;
        let last_cycle = self.database.get_last_cycle().await?;

        Ok(MonitoringReport {
            statistics,
            last_cycle,
        })
    }

    /// Logs a summary every `period` until shutdown. The first one is due
    /// one period after start. Returns how many summaries were logged.
    pub async fn run_periodic(&self, period: Duration, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut logged = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.generate_summary().await {
                    Ok(report) => {
                        tracing::info!("{}", self.format_summary(&report));
                        logged += 1;
                    }
                    Err(e) => tracing::warn!("Could not build periodic summary: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        logged
    }

    pub fn format_summary(&self, report: &MonitoringReport) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════════════╗\n");
        output.push_str("║             LISTING MONITOR SUMMARY                                  ║\n");
        output.push_str("╚══════════════════════════════════════════════════════════════════════╝\n\n");

        let stats = &report.statistics;
        output.push_str(&format!(
            "📝 Tracked listings: {} ({} awaiting notification)\n\n",
            stats.tracked_listings, stats.pending_notifications
        ));

        match &report.last_cycle {
            Some(cycle) => {
                output.push_str("🕐 Last check:\n");
                output.push_str(&format!(
                    "   • Time:     {}\n",
                    cycle.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
                ));
                output.push_str(&format!("   • Outcome:  {}\n", cycle.outcome));
                output.push_str(&format!("   • Found:    {}\n", cycle.total_found));
                output.push_str(&format!(
                    "   • New:      {} (updated: {})\n",
                    cycle.new_found, cycle.updated_found
                ));
                output.push_str(&format!("   • Notified: {}\n\n", cycle.notified));
            }
            None => output.push_str("🕐 No checks recorded yet.\n\n"),
        }

        output.push_str("📊 All time:\n");
        output.push_str(&format!(
            "   • Checks:        {} ({} failed)\n",
            stats.total_cycles, stats.failed_cycles
        ));
        output.push_str(&format!("   • New listings:  {}\n", stats.total_new_found));
        output.push_str(&format!("   • Notifications: {}\n", stats.total_notified));
        if stats.total_delivery_errors > 0 {
            output.push_str(&format!(
                "   • Delivery errors: {}\n",
                stats.total_delivery_errors
            ));
        }

        output.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::HistoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_summary_without_cycles() {
        let db = Arc::new(HistoryDatabase::in_memory().await.unwrap());
        let reporter = CycleReporter::new(db);

        let report = reporter.generate_summary().await.unwrap();
        assert!(report.last_cycle.is_none());
        assert!(reporter.format_summary(&report).contains("No checks recorded yet"));
    }

    #[tokio::test]
    async fn test_summary_shows_last_cycle() {
        let db = Arc::new(HistoryDatabase::in_memory().await.unwrap());
        db.record_cycle(&CycleStats {
            cycle_id: "c1".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: "success".to_string(),
            total_found: 25,
            new_found: 2,
            notified: 2,
            delivery_errors: 1,
            ..Default::default()
        })
        .await
        .unwrap();

        let reporter = CycleReporter::new(db);
        let report = reporter.generate_summary().await.unwrap();
        let text = reporter.format_summary(&report);

        assert_eq!(report.statistics.total_cycles, 1);
        assert!(text.contains("Found:    25"));
        assert!(text.contains("Delivery errors: 1"));
    }

    #[tokio::test]
    async fn test_periodic_summary_until_shutdown() {
        let db = Arc::new(HistoryDatabase::in_memory().await.unwrap());
        let reporter = CycleReporter::new(db);
        let (tx, rx) = watch::channel(false);

        let (logged, _) = tokio::join!(
            reporter.run_periodic(Duration::from_millis(40), rx),
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                tx.send(true).unwrap();
            }
        );

        assert!((2..=4).contains(&logged), "logged {} summaries", logged);
    }
}
