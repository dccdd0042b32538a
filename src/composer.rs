// =============================================================================
// Per-Second Sentiment Composer — decay, impacts, micro-momentum, blend
// =============================================================================
//
// Invoked once per finalized SecondCandle, in bucket-second order. Each call:
//   1. Picks its base: the previous snapshot while it is fresh, otherwise the
//      latest minute row (the handover age is an explicit config knob).
//   2. Applies one second of multiplicative news decay (3.83 %/minute).
//   3. Drains every scored impact currently queued and adds it to news.
//   4. Derives micro-momentum from the trailing 30 one-second closes.
//   5. Blends technical (0.8 base + 0.2 micro), passes reddit/analyst
//      through, and clips the composite.
//   6. Persists one snapshot row (bounded retry, composer task only).
//
// The composer owns nothing shared; it keeps a private trailing-close window
// and the last snapshot it wrote.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::PipelineState;
use crate::persistence::snapshots::{
    insert_second_snapshot_with_retry, latest_minute_row, latest_second_snapshot,
};
use crate::types::{clip, MinuteRow, SecondCandle, SecondSnapshot};

/// Documented news decay per minute (3.83 %).
pub const NEWS_DECAY_PER_MINUTE: f64 = 0.0383;
/// Per-second decay rate applied by step 2.
pub const NEWS_DECAY_PER_SECOND: f64 = NEWS_DECAY_PER_MINUTE / 60.0;
/// |news| below this snaps to zero so residues cannot linger forever.
const NEWS_RESIDUE_EPSILON: f64 = 0.01;

/// Trailing closes required before micro-momentum activates.
const MOMENTUM_WINDOW: usize = 30;
/// Momentum scale: percent price change over the window x 15.
const MOMENTUM_SCALE: f64 = 15.0;
/// Trailing closes retained (also bounds the lookback).
const CLOSE_RETENTION: usize = 60;

/// Technical blend: 80 % minute-base, 20 % micro-momentum.
const TECHNICAL_BASE_WEIGHT: f64 = 0.8;
const TECHNICAL_MICRO_WEIGHT: f64 = 0.2;

/// Composite blend weights.
const W_NEWS: f64 = 0.35;
const W_REDDIT: f64 = 0.20;
const W_TECHNICAL: f64 = 0.25;
const W_ANALYST: f64 = 0.20;

/// Base component scores feeding one composition step.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseComponents {
    pub news: f64,
    pub reddit: f64,
    pub technical: f64,
    pub analyst: f64,
}

/// One second of news decay.
pub fn decay_news(news: f64) -> f64 {
    news * (1.0 - NEWS_DECAY_PER_SECOND)
}

/// Micro-momentum from a trailing close window: percent change over the last
/// [`MOMENTUM_WINDOW`] closes, scaled and clipped. Zero until enough closes
/// have accumulated.
pub fn micro_momentum(recent_closes: &VecDeque<(i64, f64)>, close_now: f64) -> f64 {
    if recent_closes.len() < MOMENTUM_WINDOW {
        return 0.0;
    }
    let (_, close_then) = recent_closes[recent_closes.len() - MOMENTUM_WINDOW];
    if close_then <= 0.0 {
        return 0.0;
    }
    let pct = (close_now - close_then) / close_then * 100.0;
    clip(pct * MOMENTUM_SCALE, -100.0, 100.0)
}

/// The pure per-second scoring state machine, separated from I/O so the
/// decay/blend pipeline is directly testable.
pub struct ComposerCore {
    instrument_symbol: String,
    base_handover_max_age_secs: i64,
    /// The last snapshot composed (or seeded from the store at startup).
    last: Option<SecondSnapshot>,
    /// Trailing (bucket_second, close) pairs for micro-momentum.
    recent_closes: VecDeque<(i64, f64)>,
}

impl ComposerCore {
    pub fn new(instrument_symbol: impl Into<String>, base_handover_max_age_secs: i64) -> Self {
        Self {
            instrument_symbol: instrument_symbol.into(),
            base_handover_max_age_secs,
            last: None,
            recent_closes: VecDeque::with_capacity(CLOSE_RETENTION + 1),
        }
    }

    /// Adopt a snapshot read back from the store at startup, so a restart
    /// inside the handover window resumes the evolving score instead of
    /// snapping back to the minute base.
    pub fn seed(&mut self, snapshot: SecondSnapshot) {
        self.recent_closes
            .push_back((snapshot.bucket_second, snapshot.close));
        self.last = Some(snapshot);
    }

    /// Select the base components for a candle at `bucket_second`.
    fn select_base(&self, bucket_second: i64, minute_row: Option<&MinuteRow>) -> BaseComponents {
        let minute = minute_row.map(|row| BaseComponents {
            news: row.news,
            reddit: row.reddit,
            technical: row.technical,
            analyst: row.analyst,
        });

        if let Some(last) = &self.last {
            let age = bucket_second - last.bucket_second;
            if (0..=self.base_handover_max_age_secs).contains(&age) {
                // Fresh per-second state: news continues evolving from the
                // cached value. The technical base is re-read from the
                // minute row every second (the 0.8 blend must not compound
                // through the cache); the cached blend only substitutes when
                // no minute row exists. Reddit and analyst always come from
                // the minute row.
                let technical = minute
                    .map(|m| m.technical)
                    .unwrap_or(last.technical_cached);
                let minute = minute.unwrap_or_default();
                return BaseComponents {
                    news: last.news_cached,
                    technical,
                    reddit: minute.reddit,
                    analyst: minute.analyst,
                };
            }
        }

        minute.unwrap_or_default()
    }

    /// Compose one snapshot from a finalized candle, the latest minute row,
    /// and the sum of impacts drained this second.
    pub fn compose(
        &mut self,
        candle: &SecondCandle,
        minute_row: Option<&MinuteRow>,
        impact_sum: f64,
    ) -> SecondSnapshot {
        let base = self.select_base(candle.bucket_second, minute_row);

        // News: decay, then apply this second's impacts.
        let mut news = decay_news(base.news);
        news = clip(news + impact_sum, -100.0, 100.0);
        if news.abs() < NEWS_RESIDUE_EPSILON {
            news = 0.0;
        }

        // Technical: blend the base with price micro-momentum.
        let micro = micro_momentum(&self.recent_closes, candle.close);
        let technical = clip(
            TECHNICAL_BASE_WEIGHT * base.technical + TECHNICAL_MICRO_WEIGHT * micro,
            -100.0,
            100.0,
        );

        let composite = clip(
            W_NEWS * news
                + W_REDDIT * base.reddit
                + W_TECHNICAL * technical
                + W_ANALYST * base.analyst,
            -100.0,
            100.0,
        );

        let snapshot = SecondSnapshot {
            instrument_symbol: self.instrument_symbol.clone(),
            bucket_second: candle.bucket_second,
            composite,
            news_cached: news,
            technical_cached: technical,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            tick_count: candle.tick_count as i32,
        };

        self.recent_closes
            .push_back((candle.bucket_second, candle.close));
        while self.recent_closes.len() > CLOSE_RETENTION {
            self.recent_closes.pop_front();
        }
        self.last = Some(snapshot.clone());

        snapshot
    }
}

/// Run the composer until shutdown, then drain the pending-candle channel
/// before exiting.
pub async fn run_composer(state: Arc<PipelineState>, mut candle_rx: mpsc::Receiver<SecondCandle>) {
    let mut core = ComposerCore::new(
        state.config.instrument_symbol.clone(),
        state.config.base_handover_max_age_secs,
    );

    // Resume from the store when a fresh snapshot exists.
    if let Some(pool) = &state.pool {
        match latest_second_snapshot(pool, &state.config.instrument_symbol).await {
            Ok(Some(snapshot)) => {
                let age = chrono::Utc::now().timestamp() - snapshot.bucket_second;
                if age <= state.config.base_handover_max_age_secs {
                    debug!(age_secs = age, "composer seeded from stored snapshot");
                    core.seed(snapshot);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read latest snapshot at startup"),
        }
    }

    info!("per-second composer started");

    loop {
        let candle = tokio::select! {
            maybe = candle_rx.recv() => match maybe {
                Some(candle) => candle,
                None => break,
            },
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if state.is_running() {
                    continue;
                }
                // Shutdown: consume whatever the aggregator flushed.
                while let Ok(candle) = candle_rx.try_recv() {
                    compose_and_persist(&state, &mut core, candle).await;
                }
                break;
            }
        };

        compose_and_persist(&state, &mut core, candle).await;
    }

    info!("per-second composer stopped");
}

async fn compose_and_persist(
    state: &Arc<PipelineState>,
    core: &mut ComposerCore,
    candle: SecondCandle,
) {
    let minute_row = match &state.pool {
        Some(pool) => match latest_minute_row(pool).await {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "failed to read latest minute row");
                None
            }
        },
        None => None,
    };

    let impacts = state.scored_impacts.drain();
    let impact_sum: f64 = impacts.iter().map(|i| i.impact).sum();
    if !impacts.is_empty() {
        debug!(
            count = impacts.len(),
            sum = format!("{impact_sum:.2}"),
            "applying scored impacts"
        );
    }

    let snapshot = core.compose(&candle, minute_row.as_ref(), impact_sum);
    debug!(
        bucket_second = snapshot.bucket_second,
        composite = format!("{:.2}", snapshot.composite),
        label = crate::types::sentiment_label(snapshot.composite),
        news = format!("{:.2}", snapshot.news_cached),
        technical = format!("{:.2}", snapshot.technical_cached),
        "second composed"
    );

    if let Some(pool) = &state.pool {
        match insert_second_snapshot_with_retry(pool, &snapshot).await {
            Ok(()) => {
                state.snapshots_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(
                    bucket_second = snapshot.bucket_second,
                    error = %e,
                    "snapshot write failed, continuing"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(bucket: i64, close: f64) -> SecondCandle {
        SecondCandle {
            bucket_second: bucket,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            tick_count: 1,
        }
    }

    fn minute_row(news: f64, reddit: f64, technical: f64, analyst: f64) -> MinuteRow {
        MinuteRow {
            id: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 10, 15, 0, 0).unwrap(),
            composite: 0.0,
            news,
            reddit,
            technical,
            analyst,
            label: "Neutral".to_string(),
            article_count: 0,
            cached_count: 0,
            new_count: 0,
            price: 85.0,
            price_change_pct: 0.0,
            rsi_14: None,
            macd: None,
            vix: None,
        }
    }

    #[test]
    fn decay_law_over_sixty_seconds() {
        let mut news = 40.0;
        for _ in 0..60 {
            news = decay_news(news);
        }
        let expected = 40.0 * (1.0 - NEWS_DECAY_PER_SECOND).powi(60);
        assert!((news - expected).abs() < 1e-9);
        // Compounded, one minute of decay lands just above the quoted
        // 3.83 %/minute figure.
        let factor = news / 40.0;
        assert!(factor > 0.9617 && factor < 0.9630, "factor was {factor}");
    }

    #[test]
    fn smooth_decay_scenario() {
        // Minute base (news 40, reddit 25, technical 55, analyst 30); one
        // tick per second at a constant 85.00 for 60 seconds.
        let mut core = ComposerCore::new("TQQQ", 70);
        let row = minute_row(40.0, 25.0, 55.0, 30.0);

        let mut previous_news = f64::MAX;
        let mut last = None;
        for s in 0..60 {
            let snap = core.compose(&candle(1_000 + s, 85.0), Some(&row), 0.0);
            assert!(
                snap.news_cached < previous_news,
                "news must decrease monotonically"
            );
            previous_news = snap.news_cached;
            // Constant price: micro-momentum stays zero, so technical is
            // 0.8 * 55 = 44 throughout.
            assert!((snap.technical_cached - 44.0).abs() < 1e-9);
            last = Some(snap);
        }

        let last = last.unwrap();
        let expected_news = 40.0 * (1.0 - NEWS_DECAY_PER_SECOND).powi(60);
        assert!((last.news_cached - expected_news).abs() < 1e-9);
        let expected_composite =
            0.35 * expected_news + 0.20 * 25.0 + 0.25 * 44.0 + 0.20 * 30.0;
        assert!((last.composite - expected_composite).abs() < 1e-9);
    }

    #[test]
    fn breaking_news_spike_scenario() {
        let mut core = ComposerCore::new("TQQQ", 70);
        let row = minute_row(40.0, 25.0, 55.0, 30.0);

        let mut news_before_spike = 0.0;
        for s in 0..15 {
            let snap = core.compose(&candle(1_000 + s, 85.0), Some(&row), 0.0);
            news_before_spike = snap.news_cached;
        }

        // Constituent with weight 0.14, sentiment +0.9 => impact 12.6.
        let spiked = core.compose(&candle(1_015, 85.0), Some(&row), 12.6);
        let expected = decay_news(news_before_spike) + 12.6;
        assert!((spiked.news_cached - expected).abs() < 1e-9);
        assert!(spiked.news_cached > news_before_spike + 12.0);

        // Decay resumes from the spiked level.
        let after = core.compose(&candle(1_016, 85.0), Some(&row), 0.0);
        assert!((after.news_cached - decay_news(spiked.news_cached)).abs() < 1e-9);
    }

    #[test]
    fn tiny_news_residue_snaps_to_zero() {
        let mut core = ComposerCore::new("TQQQ", 70);
        let row = minute_row(0.009, 0.0, 0.0, 0.0);
        let snap = core.compose(&candle(1_000, 85.0), Some(&row), 0.0);
        assert_eq!(snap.news_cached, 0.0);
    }

    #[test]
    fn news_clips_at_plus_minus_100() {
        let mut core = ComposerCore::new("TQQQ", 70);
        let row = minute_row(95.0, 0.0, 0.0, 0.0);
        let snap = core.compose(&candle(1_000, 85.0), Some(&row), 25.0);
        assert_eq!(snap.news_cached, 100.0);
        assert!(snap.composite <= 100.0);
    }

    #[test]
    fn micro_momentum_needs_thirty_closes() {
        let mut closes = VecDeque::new();
        for s in 0..29 {
            closes.push_back((s, 85.0));
        }
        assert_eq!(micro_momentum(&closes, 86.0), 0.0);

        closes.push_back((29, 85.0));
        // 30 closes: +1 % over the window scales to 15.
        let micro = micro_momentum(&closes, 85.0 * 1.01);
        assert!((micro - 15.0).abs() < 1e-9);
    }

    #[test]
    fn micro_momentum_clips() {
        let mut closes = VecDeque::new();
        for s in 0..30 {
            closes.push_back((s, 100.0));
        }
        assert_eq!(micro_momentum(&closes, 110.0), 100.0);
        assert_eq!(micro_momentum(&closes, 90.0), -100.0);
    }

    #[test]
    fn momentum_moves_technical() {
        let mut core = ComposerCore::new("TQQQ", 70);
        let row = minute_row(0.0, 0.0, 50.0, 0.0);

        // Flat for 30 seconds, then a 1 % pop.
        for s in 0..30 {
            core.compose(&candle(1_000 + s, 85.0), Some(&row), 0.0);
        }
        let snap = core.compose(&candle(1_030, 85.85), Some(&row), 0.0);
        // micro = 15, technical = 0.8 * 50 + 0.2 * 15 = 43.
        assert!((snap.technical_cached - 43.0).abs() < 1e-9);
    }

    #[test]
    fn base_handover_uses_fresh_snapshot_then_minute_row() {
        let mut core = ComposerCore::new("TQQQ", 70);
        let row = minute_row(40.0, 25.0, 55.0, 30.0);

        let first = core.compose(&candle(1_000, 85.0), Some(&row), 0.0);

        // One second later: base news is the cached value, not the minute's.
        let second = core.compose(&candle(1_001, 85.0), Some(&row), 0.0);
        assert!((second.news_cached - decay_news(first.news_cached)).abs() < 1e-9);

        // Past the handover window the composer falls back to the minute row.
        let stale = core.compose(&candle(1_001 + 71, 85.0), Some(&row), 0.0);
        assert!((stale.news_cached - decay_news(40.0)).abs() < 1e-9);
    }

    #[test]
    fn no_minute_row_composes_from_zero_base() {
        let mut core = ComposerCore::new("TQQQ", 70);
        let snap = core.compose(&candle(1_000, 85.0), None, 5.0);
        assert!((snap.news_cached - 5.0).abs() < 1e-9);
        assert!((snap.composite - 0.35 * 5.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_carries_candle_ohlc() {
        let mut core = ComposerCore::new("TQQQ", 70);
        let c = SecondCandle {
            bucket_second: 42,
            open: 85.0,
            high: 85.5,
            low: 84.9,
            close: 85.2,
            volume: 300.0,
            tick_count: 17,
        };
        let snap = core.compose(&c, None, 0.0);
        assert_eq!(snap.bucket_second, 42);
        assert_eq!(snap.open, 85.0);
        assert_eq!(snap.high, 85.5);
        assert_eq!(snap.low, 84.9);
        assert_eq!(snap.close, 85.2);
        assert_eq!(snap.tick_count, 17);
        assert!(snap.composite.abs() <= 100.0);
    }
}
