pub mod message;
pub mod telegram;

use async_trait::async_trait;

use crate::core::MonitorResult;
use crate::listing::ClassifiedListing;

pub use message::format_listing;
pub use telegram::TelegramDispatcher;

/// Delivery transport for classified listings.
///
/// `Ok(())` means the transport acknowledged the message. Duplicate
/// suppression is not the dispatcher's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn deliver(&self, listing: &ClassifiedListing) -> MonitorResult<()>;
}
