// =============================================================================
// Company News Source — per-ticker headlines for the instrument's watchlist
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

/// Minimum time between polls of the same ticker.
const TICKER_ROTATION_INTERVAL: Duration = Duration::from_secs(40);

/// Fetches company-specific news for each watchlist ticker.
pub struct CompanyNewsSource {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    watchlist: Vec<String>,
}

/// Wire shape of one company-news item.
#[derive(Debug, Deserialize)]
struct CompanyNewsItem {
    #[serde(default)]
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    url: String,
    /// Publish time in epoch seconds.
    #[serde(default)]
    datetime: i64,
}

impl CompanyNewsSource {
    pub fn new(api_key: impl Into<String>, watchlist: Vec<String>) -> Self {
        let base_url =
            std::env::var("COMPANY_NEWS_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .expect("failed to build reqwest client for CompanyNewsSource"),
            api_key: api_key.into(),
            base_url,
            watchlist,
        }
    }
}

#[async_trait]
impl NewsSource for CompanyNewsSource {
    fn name(&self) -> &'static str {
        "company"
    }

    fn units(&self) -> Vec<String> {
        self.watchlist.clone()
    }

    fn min_unit_interval(&self) -> Duration {
        TICKER_ROTATION_INTERVAL
    }

    async fn fetch(&self, unit: &str) -> Result<Vec<Article>, FetchError> {
        let today = Utc::now().date_naive();
        let url = format!(
            "{}/company-news?symbol={}&from={}&to={}&token={}",
            self.base_url, unit, today, today, self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET company news for {unit}"))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(anyhow::anyhow!("company news API returned {status}").into());
        }

        let items: Vec<CompanyNewsItem> = resp
            .json()
            .await
            .context("failed to parse company news response")?;

        debug!(symbol = %unit, count = items.len(), "company news fetched");

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
                    hash: article_hash("company", &item.url, &item.headline),
                    source: "company".to_string(),
                    symbol: unit.to_uppercase(),
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
    fn company_news_item_parses_with_missing_fields() {
        let json = r#"[
            { "headline": "Apple beats", "summary": "Q3 beat", "url": "https://n.example/a", "datetime": 1700000000 },
            { "headline": "No URL item" }
        ]"#;
        let items: Vec<CompanyNewsItem> = serde_json::from_str(json).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].datetime, 1_700_000_000);
        assert!(items[1].url.is_empty());
    }

    #[test]
    fn rotation_interval_is_forty_seconds() {
        let src = CompanyNewsSource::new("key", vec!["AAPL".into()]);
        assert_eq!(src.min_unit_interval(), Duration::from_secs(40));
        assert_eq!(src.units(), vec!["AAPL".to_string()]);
    }
}
