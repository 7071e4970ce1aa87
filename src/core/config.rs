use anyhow::Result;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub search: SearchConfig,
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub url: String,
    pub max_pages: u32,
    pub max_listings_per_page: usize,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub min_request_delay_ms: u64,
    pub max_request_delay_ms: u64,
    /// Fetch each listing's own page before notifying about it.
    pub fetch_details: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub jitter_min_secs: u64,
    pub jitter_max_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_ceiling_secs: u64,
    pub max_consecutive_failures: u32,
    /// 0 means no limit per cycle.
    pub max_new_per_cycle: usize,
    pub delivery_timeout_secs: u64,
    pub baseline_on_empty: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_ids: Vec<i64>,
    pub api_base: String,
    pub min_message_delay_ms: u64,
    pub max_message_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub health_port: u16,
    pub log_level: String,
    /// 0 disables the periodic summary.
    pub summary_interval_secs: u64,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn string_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        // POLL_INTERVAL_SECS wins over the coarser INTERVAL_MINUTES
        let poll_interval_secs = env::var("POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| var_or("INTERVAL_MINUTES", 5u64) * 60);

        let chat_ids = env::var("TG_CHAT_IDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|id| id.trim().parse::<i64>().ok())
            .collect();

        Ok(Config {
            search: SearchConfig {
                url: string_or(
                    "SEARCH_URL",
                    "https://www.kleinanzeigen.de/s-autos/chemnitz/c216l3869r150",
                ),
                max_pages: var_or("MAX_PAGES", 1),
                max_listings_per_page: var_or("MAX_LISTINGS_PER_PAGE", 50),
                user_agent: string_or(
                    "USER_AGENT",
                    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
                ),
                request_timeout_secs: var_or("REQUEST_TIMEOUT", 20),
                fetch_concurrency: var_or("FETCH_CONCURRENCY", 2),
                max_retries: var_or("MAX_RETRIES", 2),
                retry_delay_secs: var_or("RETRY_DELAY", 3.0),
                min_request_delay_ms: var_or("MIN_DELAY_BETWEEN_REQUESTS_MS", 2000),
                max_request_delay_ms: var_or("MAX_DELAY_BETWEEN_REQUESTS_MS", 5000),
                fetch_details: var_or("FETCH_DETAILS", true),
            },
            scheduler: SchedulerConfig {
                poll_interval_secs,
                jitter_min_secs: var_or("JITTER_MIN_SECS", 2),
                jitter_max_secs: var_or("JITTER_MAX_SECS", 30),
                backoff_base_secs: var_or("BACKOFF_BASE_SECS", 30),
                backoff_ceiling_secs: var_or("BACKOFF_CEILING_SECS", 1800),
                max_consecutive_failures: var_or("MAX_CONSECUTIVE_FAILURES", 5),
                max_new_per_cycle: var_or("MAX_NEW_PER_CYCLE", 0),
                delivery_timeout_secs: var_or("DELIVERY_TIMEOUT_SECS", 15),
                baseline_on_empty: var_or("BASELINE_ON_EMPTY", false),
            },
            database: DatabaseConfig {
                path: string_or("DATABASE_PATH", "data/listings.db"),
            },
            telegram: TelegramConfig {
                bot_token: string_or("TG_BOT_TOKEN", ""),
                chat_ids,
                api_base: string_or("TG_API_BASE", "https://api.telegram.org"),
                min_message_delay_ms: var_or("MIN_DELAY_BETWEEN_MESSAGES_MS", 300),
                max_message_delay_ms: var_or("MAX_DELAY_BETWEEN_MESSAGES_MS", 1000),
            },
            monitoring: MonitoringConfig {
                health_port: var_or("HEALTH_PORT", 3000),
                log_level: string_or("LOG_LEVEL", "info"),
                summary_interval_secs: var_or("SUMMARY_INTERVAL_SECS", 3600),
            },
        })
    }

    /// Collects every configuration problem instead of stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.telegram.bot_token.is_empty() {
            errors.push("TG_BOT_TOKEN is required".to_string());
        }
        if self.telegram.chat_ids.is_empty() {
            errors.push("TG_CHAT_IDS must list at least one chat id".to_string());
        }
        if self.search.url.trim().is_empty() {
            errors.push("SEARCH_URL is required".to_string());
        }
        if self.search.max_pages == 0 {
            errors.push("MAX_PAGES must be at least 1".to_string());
        }
        if self.search.fetch_concurrency == 0 {
            errors.push("FETCH_CONCURRENCY must be at least 1".to_string());
        }
        if self.scheduler.poll_interval_secs == 0 {
            errors.push("poll interval must be positive".to_string());
        }
        if self.scheduler.jitter_min_secs > self.scheduler.jitter_max_secs {
            errors.push(format!(
                "JITTER_MIN_SECS ({}) exceeds JITTER_MAX_SECS ({})",
                self.scheduler.jitter_min_secs, self.scheduler.jitter_max_secs
            ));
        }
        if self.scheduler.backoff_base_secs > self.scheduler.backoff_ceiling_secs {
            errors.push("BACKOFF_BASE_SECS exceeds BACKOFF_CEILING_SECS".to_string());
        }
        if self.search.min_request_delay_ms > self.search.max_request_delay_ms {
            errors.push("request delay bounds are inverted".to_string());
        }
        if self.telegram.min_message_delay_ms > self.telegram.max_message_delay_ms {
            errors.push("message delay bounds are inverted".to_string());
        }

        errors
    }
}
