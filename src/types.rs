// =============================================================================
// Shared types used across the Meridian sentiment engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single trade event from the upstream tick stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    /// Event time in epoch milliseconds (sub-second resolution).
    pub timestamp_ms: i64,
    /// Trade price. Always positive on a healthy stream.
    pub price: f64,
    /// Trade volume. Zero is legal for odd-lot prints.
    pub volume: f64,
}

impl Tick {
    /// UTC bucket-second this tick belongs to (floor to 1 s).
    pub fn bucket_second(&self) -> i64 {
        self.timestamp_ms.div_euclid(1000)
    }
}

/// One candle per wall-clock second, built from all ticks in that bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondCandle {
    /// UTC bucket-second (epoch seconds, floored).
    pub bucket_second: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Sum of tick volumes in the bucket.
    pub volume: f64,
    pub tick_count: u32,
}

impl SecondCandle {
    /// Build a candle from ticks in arrival order. Returns `None` for an
    /// empty slice; a bucket-second with zero ticks produces no candle.
    pub fn from_ticks(bucket_second: i64, ticks: &[Tick]) -> Option<Self> {
        let first = ticks.first()?;
        let last = ticks.last()?;

        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut volume = 0.0;
        for t in ticks {
            if t.price > high {
                high = t.price;
            }
            if t.price < low {
                low = t.price;
            }
            volume += t.volume;
        }

        Some(Self {
            bucket_second,
            open: first.price,
            high,
            low,
            close: last.price,
            volume,
            tick_count: ticks.len() as u32,
        })
    }
}

/// A candle closed every 100 ticks, independent of wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickCandle100 {
    /// Strictly increasing emission sequence number.
    pub sequence: u64,
    pub first_tick_ms: i64,
    pub last_tick_ms: i64,
    /// Wall-clock span of the window in seconds.
    pub duration_secs: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Always 100 by construction.
    pub tick_count: u32,
}

/// A news article discovered by one of the collectors.
///
/// `sentiment` / `impact` / `weighted_contribution` are filled in exactly once
/// by the scoring worker; the article is immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Collector tag: "company", "market", or the RSS feed's source name.
    pub source: String,
    /// Constituent ticker, or "market" for index-wide news.
    pub symbol: String,
    pub headline: String,
    pub summary: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    /// Stable 32-hex digest over source, URL, and headline prefix.
    pub hash: String,
    /// Provider sentiment in [-1, +1]. None until scored.
    pub sentiment: Option<f64>,
    /// Clipped contribution to the news score in [-25, +25]. None until scored.
    pub impact: Option<f64>,
    /// sentiment x constituent weight, before the x100 scale-up.
    pub weighted_contribution: Option<f64>,
    /// When the collector first saw this article. Recorded at enqueue so the
    /// save delay never distorts it.
    pub fetched_at: DateTime<Utc>,
}

/// A scored article's contribution, queued for immediate application to the
/// live news score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredImpact {
    pub source: String,
    pub hash: String,
    pub impact: f64,
    pub scored_at: DateTime<Utc>,
}

/// One row per minute from the external comprehensive analyzer. The composer
/// reads the latest row as its base when no fresh snapshot exists.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MinuteRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub composite: f64,
    pub news: f64,
    pub reddit: f64,
    pub technical: f64,
    pub analyst: f64,
    pub label: String,
    pub article_count: i32,
    pub cached_count: i32,
    pub new_count: i32,
    pub price: f64,
    pub price_change_pct: f64,
    pub rsi_14: Option<f64>,
    pub macd: Option<f64>,
    pub vix: Option<f64>,
}

/// One row per second from the composer: the evolving composite plus the
/// second's candle, appended under a (instrument, bucket_second) unique key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecondSnapshot {
    pub instrument_symbol: String,
    pub bucket_second: i64,
    pub composite: f64,
    pub news_cached: f64,
    pub technical_cached: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: i32,
}

/// Errors the tick stream client surfaces to its reconnect supervisor.
///
/// Everything else (parse failures, transient socket errors) is handled
/// inside the stream loop and collapses into `StreamClosed`.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Upstream rejected the credential. Fatal for the component.
    #[error("tick stream authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Upstream rate-limited the connection attempt. Retryable with the
    /// capped exponential backoff, never the fast lane.
    #[error("tick stream rate limited: {0}")]
    RateLimited(String),

    /// Normal disconnect (server close, stall teardown, read error).
    #[error("tick stream closed: {0}")]
    StreamClosed(String),
}

/// Clamp `value` into [lo, hi].
pub fn clip(value: f64, lo: f64, hi: f64) -> f64 {
    value.clamp(lo, hi)
}

/// Human-readable label for a composite score in [-100, +100].
pub fn sentiment_label(composite: f64) -> &'static str {
    if composite >= 50.0 {
        "Very Bullish"
    } else if composite >= 15.0 {
        "Bullish"
    } else if composite <= -50.0 {
        "Very Bearish"
    } else if composite <= -15.0 {
        "Bearish"
    } else {
        "Neutral"
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ms: i64, price: f64, volume: f64) -> Tick {
        Tick {
            timestamp_ms: ms,
            price,
            volume,
        }
    }

    #[test]
    fn bucket_second_floors() {
        assert_eq!(tick(1_700_000_000_500, 85.0, 1.0).bucket_second(), 1_700_000_000);
        assert_eq!(tick(1_700_000_000_999, 85.0, 1.0).bucket_second(), 1_700_000_000);
        assert_eq!(tick(1_700_000_001_000, 85.0, 1.0).bucket_second(), 1_700_000_001);
    }

    #[test]
    fn second_candle_from_ticks_ohlc_invariants() {
        let ticks = vec![
            tick(1000, 85.00, 10.0),
            tick(1200, 85.40, 5.0),
            tick(1500, 84.90, 2.0),
            tick(1900, 85.10, 1.0),
        ];
        let c = SecondCandle::from_ticks(1, &ticks).unwrap();
        assert_eq!(c.open, 85.00);
        assert_eq!(c.close, 85.10);
        assert_eq!(c.high, 85.40);
        assert_eq!(c.low, 84.90);
        assert_eq!(c.tick_count, 4);
        assert!((c.volume - 18.0).abs() < f64::EPSILON);
        assert!(c.high >= c.open.max(c.close).max(c.low));
        assert!(c.low <= c.open.min(c.close).min(c.high));
    }

    #[test]
    fn second_candle_empty_returns_none() {
        assert!(SecondCandle::from_ticks(1, &[]).is_none());
    }

    #[test]
    fn clip_bounds() {
        assert_eq!(clip(150.0, -100.0, 100.0), 100.0);
        assert_eq!(clip(-150.0, -100.0, 100.0), -100.0);
        assert_eq!(clip(12.6, -25.0, 25.0), 12.6);
    }

    #[test]
    fn label_thresholds() {
        assert_eq!(sentiment_label(72.0), "Very Bullish");
        assert_eq!(sentiment_label(20.0), "Bullish");
        assert_eq!(sentiment_label(0.0), "Neutral");
        assert_eq!(sentiment_label(-20.0), "Bearish");
        assert_eq!(sentiment_label(-72.0), "Very Bearish");
    }
}
