use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::message::format_listing;
use super::NotificationDispatcher;
use crate::core::config::TelegramConfig;
use crate::core::timing::jitter_between;
use crate::core::{MonitorError, MonitorResult};
use crate::listing::ClassifiedListing;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends each listing to every configured chat via the Bot API.
pub struct TelegramDispatcher {
    client: Client,
    endpoint: String,
    chat_ids: Vec<i64>,
    min_delay: Duration,
    max_delay: Duration,
}

impl TelegramDispatcher {
    pub fn new(config: &TelegramConfig) -> MonitorResult<Self> {
        if config.bot_token.is_empty() {
            return Err(MonitorError::Configuration(
                "telegram bot token is empty".to_string(),
            ));
        }

        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.bot_token
            ),
            chat_ids: config.chat_ids.clone(),
            min_delay: Duration::from_millis(config.min_message_delay_ms),
            max_delay: Duration::from_millis(config.max_message_delay_ms),
        })
    }

    /// Errors never carry the request URL, since it embeds the bot token.
    async fn send_message(&self, chat_id: i64, text: &str) -> MonitorResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SendMessage {
                chat_id,
                text,
                disable_web_page_preview: false,
            })
            .send()
            .await
            .map_err(|e| MonitorError::Http(e.without_url()))?;

        let status = response.status();
        let body: TelegramResponse = response.json().await.map_err(|e| {
            MonitorError::Delivery(format!(
                "unreadable response ({}) for chat {}: {}",
                status,
                chat_id,
                e.without_url()
            ))
        })?;

        if !body.ok {
            return Err(MonitorError::Delivery(format!(
                "chat {} rejected message: {}",
                chat_id,
                body.description.unwrap_or_else(|| status.to_string())
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl NotificationDispatcher for TelegramDispatcher {
    /// Succeeds only when every chat accepted the message.
    async fn deliver(&self, listing: &ClassifiedListing) -> MonitorResult<()> {
        let text = format_listing(listing);
        let mut failures = Vec::new();

        for (i, chat_id) in self.chat_ids.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(jitter_between(self.min_delay, self.max_delay)).await;
            }
            if let Err(e) = self.send_message(*chat_id, &text).await {
                tracing::error!("Failed to send listing {} to {}: {}", listing.identity_key(), chat_id, e);
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            tracing::debug!("Sent listing {} to {} chats", listing.identity_key(), self.chat_ids.len());
            Ok(())
        } else {
            Err(MonitorError::Delivery(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::{ChangeKind, Listing};
    use chrono::Utc;
    use std::net::SocketAddr;
    use warp::Filter;

    fn entry() -> ClassifiedListing {
        ClassifiedListing::new(
            Listing {
                identity_key: "2871234567".to_string(),
                title: "VW Golf VII".to_string(),
                price: Some("12.500 €".to_string()),
                location: Some("Chemnitz".to_string()),
                posted_at: None,
                url: "https://www.kleinanzeigen.de/s-anzeige/golf/2871234567-216-3869".to_string(),
                content_hash: "h".to_string(),
                fetched_at: Utc::now(),
            },
            ChangeKind::New,
        )
    }

    /// Fake Bot API that rejects chat id 13.
    fn spawn_fake_api() -> SocketAddr {
        let route = warp::path!("bottoken" / "sendMessage")
            .and(warp::body::json())
            .map(|body: serde_json::Value| {
                let ok = body["chat_id"].as_i64() != Some(13);
                warp::reply::json(&serde_json::json!({
                    "ok": ok,
                    "description": if ok { None } else { Some("Bad Request: chat not found") },
                }))
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn config(addr: SocketAddr, chat_ids: Vec<i64>) -> TelegramConfig {
        TelegramConfig {
            bot_token: "token".to_string(),
            chat_ids,
            api_base: format!("http://{}", addr),
            min_message_delay_ms: 0,
            max_message_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_delivers_to_all_chats() {
        let addr = spawn_fake_api();
        let dispatcher = TelegramDispatcher::new(&config(addr, vec![1, 2])).unwrap();
        tokio_test::assert_ok!(dispatcher.deliver(&entry()).await);
    }

    #[tokio::test]
    async fn test_rejected_chat_fails_delivery() {
        let addr = spawn_fake_api();
        let dispatcher = TelegramDispatcher::new(&config(addr, vec![1, 13])).unwrap();

        let err = dispatcher.deliver(&entry()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Delivery(ref msg) if msg.contains("chat not found")));
    }

    #[tokio::test]
    async fn test_connection_error_hides_bot_token() {
        let mut cfg = config(([127, 0, 0, 1], 1).into(), vec![1]);
        cfg.bot_token = "123456:SECRET-TOKEN".to_string();
        let dispatcher = TelegramDispatcher::new(&cfg).unwrap();

        let err = dispatcher.deliver(&entry()).await.unwrap_err();
        let shown = format!("{} {:?}", err, err);
        assert!(!shown.contains("SECRET-TOKEN"), "token leaked: {}", shown);
    }

    #[tokio::test]
    async fn test_unreadable_response_hides_bot_token() {
        let route = warp::any().map(|| "not json");
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let mut cfg = config(addr, vec![1]);
        cfg.bot_token = "123456:SECRET-TOKEN".to_string();
        let dispatcher = TelegramDispatcher::new(&cfg).unwrap();

        let err = dispatcher.deliver(&entry()).await.unwrap_err();
        let shown = format!("{} {:?}", err, err);
        assert!(shown.contains("unreadable response"));
        assert!(!shown.contains("SECRET-TOKEN"), "token leaked: {}", shown);
    }

    #[test]
    fn test_empty_token_is_rejected() {
        let mut cfg = config(([127, 0, 0, 1], 1).into(), vec![1]);
        cfg.bot_token.clear();
        assert!(matches!(
            TelegramDispatcher::new(&cfg),
            Err(MonitorError::Configuration(_))
        ));
    }
}
