pub mod database;
pub mod detector;
pub mod reporter;

pub use database::{CycleStats, HistoryDatabase, HistoryRecord, HistoryStatistics, HistoryStore};
pub use detector::{ChangeDetector, Classification, HistoryLookup};
pub use reporter::{CycleReporter, MonitoringReport};
