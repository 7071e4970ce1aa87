pub mod client;
pub mod detail;
pub mod fetcher;
pub mod parser;
pub mod types;

pub use client::HttpListingFetcher;
pub use detail::DetailPageParser;
pub use fetcher::{DetailFetcher, ListingFetcher};
pub use parser::SearchPageParser;
pub use types::*;

#[cfg(test)]
pub use fetcher::{MockDetailFetcher, MockListingFetcher};
