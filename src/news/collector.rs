// =============================================================================
// News Collector Loop — per-source polling, dedup, and scoring hand-off
// =============================================================================
//
// One collector task per enabled source. Each tick (1 s) it polls the next
// unit in its rotation that is past the per-unit minimum interval, filters
// the result down to today's unseen articles, and enqueues them for scoring.
//
// All shared structures (dedup cache, queues, counters) live in the source's
// SourceContext; nothing is global.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::app_state::PipelineState;
use crate::news::dedup::DedupCache;
use crate::persistence::save_worker::SaveJob;
use crate::queues::BoundedQueue;
use crate::types::Article;

/// Capacity of each source's to-score queue.
const TO_SCORE_CAPACITY: usize = 100;
/// Capacity of each source's to-save queue.
const TO_SAVE_CAPACITY: usize = 500;
/// Per-request fetch budget.
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a unit sits out after a 429.
const RATE_LIMIT_UNIT_BACKOFF: Duration = Duration::from_secs(120);

/// Fetch failure classification. Rate limits back the unit off; everything
/// else logs and moves on.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A pollable news source: a rotation of units (tickers, feed URLs, or the
/// single "market" target) and a fetch for one unit.
#[async_trait]
pub trait NewsSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// The rotation list. Empty means the collector has nothing to do.
    fn units(&self) -> Vec<String>;

    /// Minimum time between polls of the same unit.
    fn min_unit_interval(&self) -> Duration;

    /// Fetch current articles for one unit. Implementations own their HTTP
    /// client and parsing; the returned articles carry their stable hash.
    async fn fetch(&self, unit: &str) -> Result<Vec<Article>, FetchError>;
}

/// Per-source counters reported in the shutdown summary.
#[derive(Default)]
pub struct SourceStats {
    pub fetched: AtomicU64,
    pub duplicates: AtomicU64,
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
}

/// Everything one source's collector/scorer/saver trio shares.
pub struct SourceContext {
    pub name: &'static str,
    pub dedup: DedupCache,
    pub to_score: BoundedQueue<Article>,
    pub to_save: BoundedQueue<SaveJob>,
    pub stats: SourceStats,
}

impl SourceContext {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            dedup: DedupCache::new(),
            to_score: BoundedQueue::new(TO_SCORE_CAPACITY),
            to_save: BoundedQueue::new(TO_SAVE_CAPACITY),
            stats: SourceStats::default(),
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "fetched {} | duplicates {} | enqueued {} | dropped {}",
            self.stats.fetched.load(Ordering::Relaxed),
            self.stats.duplicates.load(Ordering::Relaxed),
            self.stats.enqueued.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        )
    }
}

/// True when `published` falls on the current calendar day in the exchange
/// timezone. Stale articles re-served by feeds are filtered here.
pub fn is_exchange_today(published: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let tz = chrono_tz::America::New_York;
    published.with_timezone(&tz).date_naive() == now.with_timezone(&tz).date_naive()
}

/// Run one source's poll loop until shutdown.
pub async fn run_collector(
    state: Arc<PipelineState>,
    ctx: Arc<SourceContext>,
    source: Arc<dyn NewsSource>,
) {
    let units = source.units();
    if units.is_empty() {
        warn!(source = ctx.name, "collector has no units configured, exiting");
        return;
    }
    let min_interval = source.min_unit_interval();

    info!(
        source = ctx.name,
        units = units.len(),
        min_interval_secs = min_interval.as_secs(),
        "news collector started"
    );

    let mut last_polled: HashMap<String, Instant> = HashMap::new();
    let mut backoff_until: HashMap<String, Instant> = HashMap::new();
    let mut cursor = 0usize;
    let mut ticker = interval(Duration::from_secs(1));

    while state.is_running() {
        ticker.tick().await;
        let now = Instant::now();

        // Walk the rotation once, starting after the previous unit, and take
        // the first unit that is due.
        let mut picked: Option<String> = None;
        for offset in 0..units.len() {
            let idx = (cursor + offset) % units.len();
            let unit = &units[idx];
            if let Some(until) = backoff_until.get(unit) {
                if now < *until {
                    continue;
                }
            }
            let due = last_polled
                .get(unit)
                .map(|at| now.duration_since(*at) >= min_interval)
                .unwrap_or(true);
            if due {
                picked = Some(unit.clone());
                cursor = (idx + 1) % units.len();
                break;
            }
        }
        let Some(unit) = picked else {
            continue;
        };
        last_polled.insert(unit.clone(), now);

        match tokio::time::timeout(FETCH_TIMEOUT, source.fetch(&unit)).await {
            Err(_) => {
                warn!(source = ctx.name, unit = %unit, "news fetch timed out");
            }
            Ok(Err(FetchError::RateLimited)) => {
                backoff_until.insert(unit.clone(), now + RATE_LIMIT_UNIT_BACKOFF);
                warn!(
                    source = ctx.name,
                    unit = %unit,
                    backoff_secs = RATE_LIMIT_UNIT_BACKOFF.as_secs(),
                    "news source rate limited, backing off unit"
                );
            }
            Ok(Err(FetchError::Other(e))) => {
                warn!(source = ctx.name, unit = %unit, error = %e, "news fetch failed");
            }
            Ok(Ok(articles)) => {
                let wall_now = Utc::now();
                for article in articles {
                    ctx.stats.fetched.fetch_add(1, Ordering::Relaxed);

                    if !is_exchange_today(article.published_at, wall_now) {
                        debug!(
                            source = ctx.name,
                            published = %article.published_at,
                            "skipping stale article"
                        );
                        continue;
                    }
                    if ctx.dedup.seen_or_insert(&article.hash) {
                        ctx.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    match ctx.to_score.try_push(article) {
                        Ok(()) => {
                            ctx.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(rejected) => {
                            ctx.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                source = ctx.name,
                                headline = %rejected.headline,
                                "to_score queue full, dropping article"
                            );
                        }
                    }
                }
            }
        }
    }

    info!(source = ctx.name, "news collector stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn exchange_today_respects_new_york_calendar() {
        // 2024-01-10 01:00 UTC is still 2024-01-09 in New York (UTC-5).
        let published = Utc.with_ymd_and_hms(2024, 1, 10, 1, 0, 0).unwrap();
        let now_same_utc_day = Utc.with_ymd_and_hms(2024, 1, 10, 15, 0, 0).unwrap();
        assert!(!is_exchange_today(published, now_same_utc_day));

        // 14:00 UTC on the 10th is 09:00 in New York on the 10th.
        let published = Utc.with_ymd_and_hms(2024, 1, 10, 14, 0, 0).unwrap();
        assert!(is_exchange_today(published, now_same_utc_day));
    }

    #[test]
    fn source_context_summary_format() {
        let ctx = SourceContext::new("company");
        ctx.stats.fetched.store(10, Ordering::Relaxed);
        ctx.stats.duplicates.store(4, Ordering::Relaxed);
        ctx.stats.enqueued.store(6, Ordering::Relaxed);
        assert_eq!(ctx.summary(), "fetched 10 | duplicates 4 | enqueued 6 | dropped 0");
    }
}
