// =============================================================================
// Market News Source — index-wide headlines under the "market" bucket
// =============================================================================

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::news::collector::{FetchError, NewsSource};
use crate::news::dedup::article_hash;
use crate::types::Article;

const DEFAULT_BASE_URL: &str = "https://finnhub.io/api/v1";

/// The market feed has a single unit; poll it at most once a minute.
const MARKET_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Fetches general market news. All articles land in the "market" weight
/// bucket regardless of which tickers they mention.
pub struct MarketNewsSource {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MarketNewsItem {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    datetime: i64,
}

impl MarketNewsSource {
    pub fn new(api_key: impl Into<String>) -> Self {
        let base_url =
            std::env::var("MARKET_NEWS_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .expect("failed to build reqwest client for MarketNewsSource"),
            api_key: api_key.into(),
            base_url,
        }
    }
}

#[async_trait]
impl NewsSource for MarketNewsSource {
    fn name(&self) -> &'static str {
        "market"
    }

    fn units(&self) -> Vec<String> {
        vec!["market".to_string()]
    }

    fn min_unit_interval(&self) -> Duration {
        MARKET_POLL_INTERVAL
    }

    async fn fetch(&self, _unit: &str) -> Result<Vec<Article>, FetchError> {
        let url = format!(
            "{}/news?category=general&token={}",
            self.base_url, self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET market news")?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(anyhow::anyhow!("market news API returned {status}").into());
        }

        let items: Vec<MarketNewsItem> = resp
            .json()
            .await
            .context("failed to parse market news response")?;

        debug!(count = items.len(), "market news fetched");

        let fetched_at = Utc::now();
        let articles = items
            .into_iter()
            .filter(|item| !item.headline.is_empty() && !item.url.is_empty())
            .map(|item| {
                let published_at = Utc
                    .timestamp_opt(item.datetime, 0)
                    .single()
                    .unwrap_or(fetched_at);
                Article {
                    hash: article_hash("market", &item.url, &item.headline),
                    source: "market".to_string(),
                    symbol: "market".to_string(),
                    headline: item.headline,
                    summary: item.summary,
                    url: item.url,
                    published_at,
                    sentiment: None,
                    impact: None,
                    weighted_contribution: None,
                    fetched_at,
                }
            })
            .collect();

        Ok(articles)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_market_unit() {
        let src = MarketNewsSource::new("key");
        assert_eq!(src.units(), vec!["market".to_string()]);
        assert_eq!(src.min_unit_interval(), Duration::from_secs(60));
    }
}
