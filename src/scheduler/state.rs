use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::config::SchedulerConfig;
use crate::core::timing::jitter_between;

/// Backoff doubling stops growing after this many failures; the ceiling
/// usually caps it long before.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollPhase {
    Idle,
    Fetching,
    Classifying,
    Persisting,
    Notifying,
    Backoff,
}

impl PollPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollPhase::Idle => "IDLE",
            PollPhase::Fetching => "FETCHING",
            PollPhase::Classifying => "CLASSIFYING",
            PollPhase::Persisting => "PERSISTING",
            PollPhase::Notifying => "NOTIFYING",
            PollPhase::Backoff => "BACKOFF",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            PollPhase::Idle => "💤",
            PollPhase::Fetching => "📡",
            PollPhase::Classifying => "🔍",
            PollPhase::Persisting => "💾",
            PollPhase::Notifying => "📨",
            PollPhase::Backoff => "⏳",
        }
    }
}

impl fmt::Display for PollPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Every page fetched, persisted, every delivery acknowledged.
    Success,
    /// Completed, but some pages or deliveries failed.
    Degraded,
    FetchFailed,
    PersistFailed,
    /// Shutdown requested before the cycle could finish.
    Aborted,
    /// Another cycle was still in flight.
    Skipped,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::Degraded => "degraded",
            CycleOutcome::FetchFailed => "fetch_failed",
            CycleOutcome::PersistFailed => "persist_failed",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::Skipped => "skipped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::FetchFailed | CycleOutcome::PersistFailed)
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and limits the scheduler reads at cycle start.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    pub max_consecutive_failures: u32,
    /// 0 means unlimited.
    pub max_new_per_cycle: usize,
    pub delivery_timeout: Duration,
    pub baseline_on_empty: bool,
}

impl PollPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            jitter_min: Duration::from_secs(config.jitter_min_secs),
            jitter_max: Duration::from_secs(config.jitter_max_secs),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_ceiling: Duration::from_secs(config.backoff_ceiling_secs),
            max_consecutive_failures: config.max_consecutive_failures,
            max_new_per_cycle: config.max_new_per_cycle,
            delivery_timeout: Duration::from_secs(config.delivery_timeout_secs.max(1)),
            baseline_on_empty: config.baseline_on_empty,
        }
    }

    /// `base * 2^(failures - 1)`, capped at the ceiling. Zero when healthy.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - 1).min(MAX_BACKOFF_EXPONENT);
        self.backoff_base
            .saturating_mul(2u32.pow(exponent))
            .min(self.backoff_ceiling)
    }

    pub fn work_limit(&self) -> Option<usize> {
        (self.max_new_per_cycle > 0).then_some(self.max_new_per_cycle)
    }
}

/// Scheduler bookkeeping carried from one cycle to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollState {
    pub phase: Option<PollPhase>,
    pub consecutive_failures: u32,
    pub cycles_run: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
}

impl PollState {
    pub fn phase(&self) -> PollPhase {
        self.phase.unwrap_or(PollPhase::Idle)
    }

    pub fn enter(mut self, phase: PollPhase) -> Self {
        tracing::debug!("{} {} → {}", phase.emoji(), self.phase(), phase);
        self.phase = Some(phase);
        self
    }

    /// Folds a finished cycle into the state.
    ///
    /// Fetch and persistence failures grow the failure streak and park the
    /// scheduler in BACKOFF. Only a clean success resets the streak; a
    /// degraded cycle leaves it as it was.
    pub fn complete(mut self, outcome: CycleOutcome, at: DateTime<Utc>) -> Self {
        match outcome {
            CycleOutcome::Skipped => return self,
            CycleOutcome::Success => {
                self.consecutive_failures = 0;
                self.last_success_at = Some(at);
            }
            CycleOutcome::FetchFailed | CycleOutcome::PersistFailed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
            CycleOutcome::Degraded | CycleOutcome::Aborted => {}
        }

        self.cycles_run += 1;
        self.last_cycle_at = Some(at);
        self.last_outcome = Some(outcome);
        let phase = if outcome.is_failure() {
            PollPhase::Backoff
        } else {
            PollPhase::Idle
        };
        self.enter(phase)
    }

    pub fn in_backoff(&self) -> bool {
        self.phase() == PollPhase::Backoff
    }

    pub fn exceeds_retry_ceiling(&self, policy: &PollPolicy) -> bool {
        self.consecutive_failures > policy.max_consecutive_failures
    }

    /// Delay before the next cycle: backoff (if any) followed by the regular
    /// interval plus jitter.
    pub fn next_delay(&self, policy: &PollPolicy) -> Duration {
        let idle = policy.interval + jitter_between(policy.jitter_min, policy.jitter_max);
        if self.in_backoff() {
            idle + policy.backoff_delay(self.consecutive_failures)
        } else {
            idle
        }
    }
}
