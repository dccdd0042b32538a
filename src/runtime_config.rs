// =============================================================================
// Engine Configuration — env-driven settings resolved once at startup
// =============================================================================
//
// Every knob the pipeline honours lives here. Configuration is read from the
// environment (plus optional JSON files for the constituent weights and RSS
// feed list) in a single pass; the resulting EngineConfig is immutable for
// the lifetime of the process.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Weight of index-wide ("market") news when an article's symbol is not a
/// recognised constituent.
pub const MARKET_WEIGHT: f64 = 0.30;

// =============================================================================
// Constituent weights
// =============================================================================

/// Market-cap weights of the instrument's constituents plus the "market"
/// bucket. Ticker weights + MARKET_WEIGHT sum to ~1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentWeights {
    pub tickers: HashMap<String, f64>,
}

impl Default for InstrumentWeights {
    fn default() -> Self {
        let mut tickers = HashMap::new();
        tickers.insert("AAPL".to_string(), 0.12);
        tickers.insert("MSFT".to_string(), 0.11);
        tickers.insert("NVDA".to_string(), 0.11);
        tickers.insert("AMZN".to_string(), 0.08);
        tickers.insert("GOOGL".to_string(), 0.07);
        tickers.insert("META".to_string(), 0.06);
        tickers.insert("TSLA".to_string(), 0.05);
        tickers.insert("AVGO".to_string(), 0.04);
        tickers.insert("COST".to_string(), 0.03);
        tickers.insert("NFLX".to_string(), 0.03);
        Self { tickers }
    }
}

impl InstrumentWeights {
    /// Load a `{ "TICKER": weight, ... }` table from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read weights config from {}", path.display()))?;
        let tickers: HashMap<String, f64> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse weights config from {}", path.display()))?;
        Ok(Self { tickers })
    }

    /// Weight for `symbol`, falling back to the market bucket for anything
    /// not in the table (including the literal "market" tag).
    pub fn weight_for(&self, symbol: &str) -> f64 {
        self.tickers
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(MARKET_WEIGHT)
    }

    /// Watchlist for the company-news collector: constituents sorted by
    /// descending weight so the heaviest names poll first in the rotation.
    pub fn watchlist(&self) -> Vec<String> {
        let mut entries: Vec<(&String, &f64)> = self.tickers.iter().collect();
        entries.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.into_iter().map(|(sym, _)| sym.clone()).collect()
    }

    /// Warn if ticker weights plus the market bucket drift from 1.0.
    pub fn validate(&self) {
        let sum: f64 = self.tickers.values().sum::<f64>() + MARKET_WEIGHT;
        if (sum - 1.0).abs() > 0.02 {
            warn!(
                sum = format!("{sum:.4}"),
                "constituent weights + market bucket do not sum to 1.0"
            );
        }
    }
}

// =============================================================================
// Sentiment provider selection
// =============================================================================

/// Which scoring backend to use. Selected once at startup from
/// `SENTIMENT_PROVIDER`; there is no runtime switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentimentProviderKind {
    Fast,
    Accurate,
}

impl Default for SentimentProviderKind {
    fn default() -> Self {
        Self::Fast
    }
}

impl std::fmt::Display for SentimentProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Accurate => write!(f, "accurate"),
        }
    }
}

impl std::str::FromStr for SentimentProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "accurate" => Ok(Self::Accurate),
            other => Err(format!("unknown sentiment provider '{other}'")),
        }
    }
}

// =============================================================================
// RSS feed list
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RssFeedEntry {
    pub url: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RssFeedsConfig {
    #[serde(default)]
    pub feeds: Vec<RssFeedEntry>,
}

impl RssFeedsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read RSS feeds config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse RSS feeds config from {}", path.display()))?;
        Ok(config)
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Immutable engine configuration resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Symbol the pipeline runs on.
    pub instrument_symbol: String,

    /// Credential for the streaming tick upstream.
    pub tick_stream_api_key: String,

    /// Scoring backend selection.
    pub sentiment_provider: SentimentProviderKind,
    pub sentiment_api_key_fast: String,
    pub sentiment_api_key_accurate: String,

    /// News source credentials.
    pub company_news_api_key: String,
    pub market_news_api_key: String,

    /// Collector capability flags.
    pub enable_company_news: bool,
    pub enable_market_news: bool,
    pub enable_rss_news: bool,

    /// Feed list for the RSS collector (empty unless configured).
    pub rss_feeds: RssFeedsConfig,

    /// Force the market-hours clock to report always-open (test mode).
    pub skip_market_hours_check: bool,

    /// Canonical persistent store.
    pub database_url: String,

    /// Constituent weight table.
    pub weights: InstrumentWeights,

    /// Maximum age of the latest snapshot for it to serve as the composer's
    /// base instead of the minute row.
    pub base_handover_max_age_secs: i64,
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

impl EngineConfig {
    /// Read the full configuration from the environment. Missing credentials
    /// are tolerated here; each subsystem decides at startup whether it can
    /// run without its key.
    pub fn from_env() -> Self {
        let instrument_symbol =
            std::env::var("INSTRUMENT_SYMBOL").unwrap_or_else(|_| "TQQQ".to_string());

        let sentiment_provider = std::env::var("SENTIMENT_PROVIDER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let weights = match std::env::var("WEIGHTS_CONFIG_PATH") {
            Ok(path) => InstrumentWeights::load(&path).unwrap_or_else(|e| {
                warn!(error = %e, "failed to load weights config, using defaults");
                InstrumentWeights::default()
            }),
            Err(_) => InstrumentWeights::default(),
        };
        weights.validate();

        let enable_rss_news = env_bool("ENABLE_RSS_NEWS", false);
        let rss_feeds = if enable_rss_news {
            match std::env::var("RSS_FEEDS_CONFIG_PATH") {
                Ok(path) => RssFeedsConfig::load(&path).unwrap_or_else(|e| {
                    warn!(error = %e, "failed to load RSS feeds config, RSS collector will idle");
                    RssFeedsConfig::default()
                }),
                Err(_) => {
                    warn!("ENABLE_RSS_NEWS set but RSS_FEEDS_CONFIG_PATH missing");
                    RssFeedsConfig::default()
                }
            }
        } else {
            RssFeedsConfig::default()
        };

        let config = Self {
            instrument_symbol,
            tick_stream_api_key: std::env::var("TICK_STREAM_API_KEY").unwrap_or_default(),
            sentiment_provider,
            sentiment_api_key_fast: std::env::var("SENTIMENT_API_KEY_FAST").unwrap_or_default(),
            sentiment_api_key_accurate: std::env::var("SENTIMENT_API_KEY_ACCURATE")
                .unwrap_or_default(),
            company_news_api_key: std::env::var("COMPANY_NEWS_API_KEY").unwrap_or_default(),
            market_news_api_key: std::env::var("MARKET_NEWS_API_KEY").unwrap_or_default(),
            enable_company_news: env_bool("ENABLE_COMPANY_NEWS", true),
            enable_market_news: env_bool("ENABLE_MARKET_NEWS", true),
            enable_rss_news,
            rss_feeds,
            skip_market_hours_check: env_bool("SKIP_MARKET_HOURS_CHECK", false),
            database_url: std::env::var("DATABASE_URL").unwrap_or_default(),
            weights,
            base_handover_max_age_secs: std::env::var("BASE_HANDOVER_MAX_AGE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(70),
        };

        info!(
            instrument = %config.instrument_symbol,
            provider = %config.sentiment_provider,
            company_news = config.enable_company_news,
            market_news = config.enable_market_news,
            rss_news = config.enable_rss_news,
            skip_hours = config.skip_market_hours_check,
            "engine configuration loaded"
        );

        config
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one_with_market_bucket() {
        let w = InstrumentWeights::default();
        let sum: f64 = w.tickers.values().sum::<f64>() + MARKET_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-9, "sum was {sum}");
    }

    #[test]
    fn weight_for_falls_back_to_market_bucket() {
        let w = InstrumentWeights::default();
        assert!((w.weight_for("AAPL") - 0.12).abs() < f64::EPSILON);
        assert!((w.weight_for("aapl") - 0.12).abs() < f64::EPSILON);
        assert!((w.weight_for("market") - MARKET_WEIGHT).abs() < f64::EPSILON);
        assert!((w.weight_for("ZZZZ") - MARKET_WEIGHT).abs() < f64::EPSILON);
    }

    #[test]
    fn watchlist_sorted_by_descending_weight() {
        let w = InstrumentWeights::default();
        let list = w.watchlist();
        assert_eq!(list.len(), 10);
        assert_eq!(list[0], "AAPL");
        // MSFT and NVDA are tied; both must appear in the top three.
        assert!(list[1..3].contains(&"MSFT".to_string()));
        assert!(list[1..3].contains(&"NVDA".to_string()));
    }

    #[test]
    fn provider_kind_parses() {
        assert_eq!(
            "fast".parse::<SentimentProviderKind>().unwrap(),
            SentimentProviderKind::Fast
        );
        assert_eq!(
            "Accurate".parse::<SentimentProviderKind>().unwrap(),
            SentimentProviderKind::Accurate
        );
        assert!("gpt".parse::<SentimentProviderKind>().is_err());
    }

    #[test]
    fn rss_feeds_config_parses() {
        let json = r#"{ "feeds": [ { "url": "https://example.com/rss", "source": "example" } ] }"#;
        let cfg: RssFeedsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.feeds.len(), 1);
        assert_eq!(cfg.feeds[0].source, "example");
    }
}
