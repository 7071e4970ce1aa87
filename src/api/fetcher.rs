use async_trait::async_trait;

use super::types::{FetchOutcome, SearchParams};
use crate::core::MonitorResult;
use crate::listing::{Listing, ListingDetails};

/// Source of raw listing records for one poll cycle.
///
/// Implementations report unreachable pages in [`FetchOutcome::failures`]
/// instead of dropping them silently. `Err` is reserved for failures where
/// nothing could be attempted at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    async fn fetch(&self, params: &SearchParams) -> MonitorResult<FetchOutcome>;
}

/// Loads a listing's own page for the fields the search card lacks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn fetch_details(&self, listing: &Listing) -> MonitorResult<ListingDetails>;
}
