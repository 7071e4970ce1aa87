//! Watches a classifieds search and reports new or changed listings.
//!
//! A poll cycle fetches the result pages, normalizes the records, classifies
//! them against the persisted listing history, commits the history and only
//! then hands the new and changed listings to the notification dispatcher.

pub mod api;
pub mod core;
pub mod listing;
pub mod monitoring;
pub mod notify;
pub mod scheduler;
