use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::core::config::SearchConfig;
use crate::listing::RawRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub url: String,
    pub max_pages: u32,
    pub max_listings_per_page: usize,
}

impl SearchParams {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_pages: config.max_pages.max(1),
            max_listings_per_page: config.max_listings_per_page,
        }
    }

    /// URL of the given 1-based result page.
    ///
    /// The site paginates with a `seite:N` path segment placed before the
    /// trailing category code: `/s-autos/chemnitz/seite:2/c216l3869r150`.
    pub fn page_url(&self, page: u32) -> String {
        if page <= 1 {
            return self.url.clone();
        }

        let Ok(mut url) = Url::parse(&self.url) else {
            return self.url.clone();
        };

        let mut segments: Vec<String> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        segments.retain(|s| !s.starts_with("seite:"));

        let insert_at = segments.len().saturating_sub(1);
        segments.insert(insert_at, format!("seite:{}", page));
        url.set_path(&segments.join("/"));

        url.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFailure {
    pub page: u32,
    pub url: String,
    pub reason: String,
}

/// Everything one fetch produced. Non-empty `failures` together with some
/// records means a partial (degraded) fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub failures: Vec<PageFailure>,
    pub pages_attempted: u32,
}

impl FetchOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty() && (self.failures.len() as u32) < self.pages_attempted
    }

    pub fn is_total_failure(&self) -> bool {
        self.pages_attempted > 0 && self.failures.len() as u32 >= self.pages_attempted
    }
}
