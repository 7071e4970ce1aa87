use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::detail::DetailPageParser;
use super::fetcher::{DetailFetcher, ListingFetcher};
use super::parser::SearchPageParser;
use super::types::{FetchOutcome, PageFailure, SearchParams};
use crate::core::config::SearchConfig;
use crate::core::timing::jitter_between;
use crate::core::{MonitorError, MonitorResult};
use crate::listing::{Listing, ListingDetails};

/// Fetches search result and listing pages over HTTP with per-request
/// timeouts, bounded page concurrency and a randomized gap between requests.
pub struct HttpListingFetcher {
    client: Client,
    parser: SearchPageParser,
    detail_parser: DetailPageParser,
    request_timeout: Duration,
    concurrency: usize,
    max_retries: u32,
    retry_delay: Duration,
    min_request_gap: Duration,
    max_request_gap: Duration,
    /// Earliest moment the next request may start.
    next_request_at: Mutex<Option<Instant>>,
}

impl HttpListingFetcher {
    pub fn new(config: &SearchConfig) -> MonitorResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));

        let request_timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            parser: SearchPageParser::new(),
            detail_parser: DetailPageParser::new(),
            request_timeout,
            concurrency: config.fetch_concurrency.max(1),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs_f64(config.retry_delay_secs.max(0.0)),
            min_request_gap: Duration::from_millis(config.min_request_delay_ms),
            max_request_gap: Duration::from_millis(config.max_request_delay_ms),
            next_request_at: Mutex::new(None),
        })
    }

    /// Waits for this request's slot. The lock is held while sleeping, so
    /// concurrent pages queue up behind each other.
    async fn pace(&self) {
        let mut next_request_at = self.next_request_at.lock().await;
        if let Some(at) = *next_request_at {
            if at > Instant::now() {
                tracing::debug!("Sleeping {:?} before next request", at - Instant::now());
                tokio::time::sleep_until(at).await;
            }
        }
        *next_request_at =
            Some(Instant::now() + jitter_between(self.min_request_gap, self.max_request_gap));
    }

    async fn fetch_once(&self, url: &str) -> MonitorResult<String> {
        self.pace().await;
        tracing::debug!("Fetching: {}", url);

        let request = async {
            let response = self.client.get(url).send().await?;
            let status = response.status();

            if status == StatusCode::FORBIDDEN {
                tracing::warn!("⚠️  403 Forbidden for {} - possibly blocked", url);
                return Err(MonitorError::Blocked(url.to_string()));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                tracing::warn!("⚠️  429 Too Many Requests for {}", url);
                return Err(MonitorError::RateLimited(url.to_string()));
            }

            let body = response.error_for_status()?.text().await?;
            tracing::debug!("Fetched {} bytes from {}", body.len(), url);
            Ok::<String, MonitorError>(body)
        };

        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Err(MonitorError::Http(e))) if e.is_timeout() => Err(MonitorError::Timeout {
                operation: format!("GET {}", url),
                secs: self.request_timeout.as_secs(),
            }),
            Ok(result) => result,
            Err(_) => Err(MonitorError::Timeout {
                operation: format!("GET {}", url),
                secs: self.request_timeout.as_secs(),
            }),
        }
    }

    /// One page with linear retry delay on transient errors.
    async fn fetch_page(&self, url: &str) -> MonitorResult<String> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_delay * attempt;
                    tracing::warn!(
                        "⏳ {} - retrying in {:?} (attempt {}/{})",
                        e,
                        delay,
                        attempt,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ListingFetcher for HttpListingFetcher {
    async fn fetch(&self, params: &SearchParams) -> MonitorResult<FetchOutcome> {
        let pages: Vec<(u32, String)> = (1..=params.max_pages.max(1))
            .map(|page| (page, params.page_url(page)))
            .collect();

        // buffered keeps page order, so the first occurrence of a listing stays first
        let results: Vec<(u32, String, MonitorResult<String>)> = stream::iter(pages)
            .map(|(page, url)| async move {
                let result = self.fetch_page(&url).await;
                (page, url, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut outcome = FetchOutcome {
            pages_attempted: results.len() as u32,
            ..Default::default()
        };

        for (page, url, result) in results {
            match result {
                Ok(html) => {
                    let records = self
                        .parser
                        .parse(&html, page, params.max_listings_per_page);
                    outcome.records.extend(records);
                }
                Err(e) => {
                    tracing::error!("❌ Page {} failed: {}", page, e);
                    outcome.failures.push(PageFailure {
                        page,
                        url,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl DetailFetcher for HttpListingFetcher {
    async fn fetch_details(&self, listing: &Listing) -> MonitorResult<ListingDetails> {
        let html = self.fetch_page(&listing.url).await?;
        Ok(self.detail_parser.parse(&html, &listing.title))
    }
}
