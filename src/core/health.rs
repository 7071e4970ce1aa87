use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentHealth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub history_store: bool,
    pub fetcher: bool,
    pub dispatcher: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    /// Set once consecutive failures exceed the configured ceiling.
    pub degraded: bool,
}

#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    failure_ceiling: u32,
    status: Arc<RwLock<ComponentHealth>>,
}

impl HealthChecker {
    pub fn new(failure_ceiling: u32) -> Self {
        Self {
            start_time: std::time::Instant::now(),
            failure_ceiling,
            status: Arc::new(RwLock::new(ComponentHealth::default())),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let components = self.status.read().await.clone();

        let status = if components.degraded {
            "degraded"
        } else if components.last_success_at.is_some() {
            "healthy"
        } else {
            "starting"
        };

        HealthStatus {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
        }
    }

    pub async fn update_component(&self, component: &str, healthy: bool) {
        let mut status = self.status.write().await;
        match component {
            "history_store" => status.history_store = healthy,
            "fetcher" => status.fetcher = healthy,
            "dispatcher" => status.dispatcher = healthy,
            other => tracing::debug!("Ignoring health update for unknown component {}", other),
        }
    }

    pub async fn record_success(&self) {
        let mut status = self.status.write().await;
        status.consecutive_failures = 0;
        status.degraded = false;
        status.last_success_at = Some(Utc::now());
        status.last_failure = None;
    }

    /// Records a failed cycle; returns true when this failure pushed the
    /// monitor into the degraded state.
    pub async fn record_failure(&self, consecutive_failures: u32, reason: &str) -> bool {
        let mut status = self.status.write().await;
        let was_degraded = status.degraded;
        status.consecutive_failures = consecutive_failures;
        status.last_failure = Some(reason.to_string());
        status.degraded = consecutive_failures > self.failure_ceiling;
        status.degraded && !was_degraded
    }

    pub async fn is_degraded(&self) -> bool {
        self.status.read().await.degraded
    }
}
