use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{Listing, RawRecord};
use crate::core::{MonitorError, MonitorResult};

/// Single boundary between site-specific record shapes and [`Listing`].
pub trait ListingNormalizer: Send + Sync {
    fn normalize(&self, raw: &RawRecord) -> MonitorResult<Listing>;

    /// Normalizes a batch, dropping records that cannot be mapped.
    fn normalize_all(&self, raw: &[RawRecord]) -> (Vec<Listing>, usize) {
        let mut listings = Vec::with_capacity(raw.len());
        let mut rejected = 0;

        for record in raw {
            match self.normalize(record) {
                Ok(listing) => listings.push(listing),
                Err(e) => {
                    rejected += 1;
                    tracing::warn!("Skipping record from page {}: {}", record.page, e);
                }
            }
        }

        (listings, rejected)
    }
}

/// Normalizer for records produced by the search page parser.
#[derive(Debug, Clone)]
pub struct SearchResultNormalizer {
    base_url: String,
    max_title_len: usize,
}

impl Default for SearchResultNormalizer {
    fn default() -> Self {
        Self::new("https://www.kleinanzeigen.de")
    }
}

impl SearchResultNormalizer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            max_title_len: 100,
        }
    }

    fn absolute_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            format!("{}/{}", self.base_url, href)
        }
    }
}

impl ListingNormalizer for SearchResultNormalizer {
    fn normalize(&self, raw: &RawRecord) -> MonitorResult<Listing> {
        let identity_key = ["id", "ad_id", "listing_id"]
            .iter()
            .find_map(|key| raw.get(key).and_then(value_as_text))
            .ok_or_else(|| MonitorError::Normalize("record has no source id".to_string()))?;

        let href = raw
            .get("url")
            .and_then(value_as_text)
            .ok_or_else(|| MonitorError::Normalize(format!("listing {} has no url", identity_key)))?;

        let title: String = raw
            .get("title")
            .and_then(value_as_text)
            .unwrap_or_default()
            .chars()
            .take(self.max_title_len)
            .collect();

        let price = raw.get("price").and_then(value_as_text);
        let location = raw.get("location").and_then(value_as_text);
        let posted_at = raw.get("posted_at").and_then(value_as_text);
        let url = self.absolute_url(&href);

        let content_hash = content_hash(&title, price.as_deref(), location.as_deref(), &url);

        Ok(Listing {
            identity_key,
            title,
            price,
            location,
            posted_at,
            url,
            content_hash,
            fetched_at: Utc::now(),
        })
    }
}

/// Digest over the descriptive fields a seller can change.
///
/// `posted_at` is left out: the site renders it relative to today, so it
/// changes without the listing changing.
pub fn content_hash(title: &str, price: Option<&str>, location: Option<&str>, url: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [Some(title), price, location, Some(url)] {
        match field {
            Some(text) => {
                hasher.update([1u8]);
                hasher.update(text.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// Trimmed, whitespace-collapsed text; `None` for empty values.
fn value_as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" "),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
