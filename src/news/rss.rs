// =============================================================================
// RSS News Source — feed-list pull with RFC-2822 publish dates
// =============================================================================

use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rss::Channel;
use tracing::debug;

use crate::news::collector::{FetchError, NewsSource};
use crate::news::dedup::article_hash;
use crate::runtime_config::RssFeedEntry;
use crate::types::Article;

/// Minimum time between polls of the same feed.
const FEED_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Pulls a configured list of RSS feeds. Items without a parseable publish
/// date are dropped; feeds cannot be trusted to mean "now" by omission.
pub struct RssNewsSource {
    client: reqwest::Client,
    /// feed URL -> source tag recorded on its articles.
    sources_by_url: HashMap<String, String>,
    feed_urls: Vec<String>,
}

impl RssNewsSource {
    pub fn new(feeds: &[RssFeedEntry]) -> Self {
        let sources_by_url = feeds
            .iter()
            .map(|f| (f.url.clone(), f.source.clone()))
            .collect();
        let feed_urls = feeds.iter().map(|f| f.url.clone()).collect();
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .expect("failed to build reqwest client for RssNewsSource"),
            sources_by_url,
            feed_urls,
        }
    }
}

#[async_trait]
impl NewsSource for RssNewsSource {
    fn name(&self) -> &'static str {
        "rss"
    }

    fn units(&self) -> Vec<String> {
        self.feed_urls.clone()
    }

    fn min_unit_interval(&self) -> Duration {
        FEED_POLL_INTERVAL
    }

    async fn fetch(&self, unit: &str) -> Result<Vec<Article>, FetchError> {
        let source_tag = self
            .sources_by_url
            .get(unit)
            .cloned()
            .unwrap_or_else(|| "rss".to_string());

        let resp = self
            .client
            .get(unit)
            .send()
            .await
            .with_context(|| format!("GET RSS feed {unit}"))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(anyhow::anyhow!("RSS feed {unit} returned {status}").into());
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("read RSS body from {unit}"))?;
        let channel = Channel::read_from(Cursor::new(bytes))
            .with_context(|| format!("parse RSS feed {unit}"))?;

        let fetched_at = Utc::now();
        let articles: Vec<Article> = channel
            .items()
            .iter()
            .filter_map(|item| {
                let headline = item.title()?.to_string();
                let url = item
                    .link()
                    .or_else(|| item.guid().map(|g| g.value()))?
                    .to_string();
                // No publish date: drop the item entirely.
                let published_at = item
                    .pub_date()
                    .and_then(parse_rfc2822)?;

                Some(Article {
                    hash: article_hash(&source_tag, &url, &headline),
                    source: source_tag.clone(),
                    symbol: "market".to_string(),
                    headline,
                    summary: item.description().unwrap_or_default().to_string(),
                    url,
                    published_at,
                    sentiment: None,
                    impact: None,
                    weighted_contribution: None,
                    fetched_at,
                })
            })
            .collect();

        debug!(feed = %unit, count = articles.len(), "RSS feed fetched");
        Ok(articles)
    }
}

fn parse_rfc2822(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
