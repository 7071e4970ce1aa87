pub mod normalizer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use normalizer::{content_hash, ListingNormalizer, SearchResultNormalizer};

/// Loosely-shaped record as scraped from one search result card.
///
/// Keys depend on the page markup; only the normalizer interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub page: u32,
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(page: u32) -> Self {
        Self {
            page,
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Canonical listing; everything downstream of the normalizer uses only this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub identity_key: String,
    pub title: String,
    pub price: Option<String>,
    pub location: Option<String>,
    /// As displayed by the site ("Heute, 14:05", "03.10.2026").
    pub posted_at: Option<String>,
    pub url: String,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    New,
    Updated,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Updated => "updated",
            ChangeKind::Unchanged => "unchanged",
        }
    }

    pub fn is_notifiable(&self) -> bool {
        matches!(self, ChangeKind::New | ChangeKind::Updated)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra fields scraped from a listing's own page. Absent values were not
/// found on the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDetails {
    pub title: Option<String>,
    pub brand: Option<String>,
    pub year: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    /// German postcode.
    pub plz: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedListing {
    pub listing: Listing,
    pub kind: ChangeKind,
    /// Filled in just before delivery; `None` means the card data is all we have.
    #[serde(default)]
    pub details: Option<ListingDetails>,
}

impl ClassifiedListing {
    pub fn new(listing: Listing, kind: ChangeKind) -> Self {
        Self {
            listing,
            kind,
            details: None,
        }
    }

    pub fn with_details(mut self, details: ListingDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn identity_key(&self) -> &str {
        &self.listing.identity_key
    }

    pub fn content_hash(&self) -> &str {
        &self.listing.content_hash
    }
}
