pub mod poller;
pub mod state;

pub use poller::{CycleReport, PollScheduler};
pub use state::{CycleOutcome, PollPhase, PollPolicy, PollState};
