use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus instruments for the poll loop, kept in a private registry.
#[derive(Clone)]
pub struct MonitorMetrics {
    registry: Registry,
    cycles: IntCounterVec,
    classified: IntCounterVec,
    notifications: IntCounterVec,
    consecutive_failures: IntGauge,
}

impl MonitorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("classifieds_monitor".to_string()), None)?;

        let cycles = IntCounterVec::new(
            Opts::new("cycles_total", "Poll cycles by outcome"),
            &["outcome"],
        )?;
        let classified = IntCounterVec::new(
            Opts::new("listings_classified_total", "Listings by classification"),
            &["class"],
        )?;
        let notifications = IntCounterVec::new(
            Opts::new("notifications_total", "Delivery attempts by outcome"),
            &["outcome"],
        )?;
        let consecutive_failures = IntGauge::new(
            "consecutive_failures",
            "Failed cycles since the last fully successful one",
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(classified.clone()))?;
        registry.register(Box::new(notifications.clone()))?;
        registry.register(Box::new(consecutive_failures.clone()))?;

        Ok(Self {
            registry,
            cycles,
            classified,
            notifications,
            consecutive_failures,
        })
    }

    pub fn record_cycle(&self, outcome: &str) {
        self.cycles.with_label_values(&[outcome]).inc();
    }

    pub fn record_classified(&self, class: &str, count: usize) {
        self.classified
            .with_label_values(&[class])
            .inc_by(count as u64);
    }

    pub fn record_notification(&self, outcome: &str) {
        self.notifications.with_label_values(&[outcome]).inc();
    }

    pub fn set_consecutive_failures(&self, failures: u32) {
        self.consecutive_failures.set(failures as i64);
    }

    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
