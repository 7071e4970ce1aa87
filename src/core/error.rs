use thiserror::Error;

/// Failures surfaced by the monitoring pipeline.
///
/// `Fetch` and `Persistence` abandon the current cycle and send the scheduler
/// into backoff. `Delivery` and `Timeout` during notification only affect the
/// listing being delivered.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("access denied (403) for {0}")]
    Blocked(String),
    #[error("rate limited (429) for {0}")]
    RateLimited(String),
    #[error("history store failure: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },
    #[error("record could not be normalized: {0}")]
    Normalize(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    /// Whether retrying the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MonitorError::Timeout { .. } | MonitorError::Fetch(_) => true,
            MonitorError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }
}

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;
