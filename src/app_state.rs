// =============================================================================
// Pipeline State — shared context for the Meridian sentiment engine
// =============================================================================
//
// The single context struct every worker holds an Arc to. It ties together
// the immutable configuration, the market-hours clock, the tick aggregator,
// the global scored-impacts queue, and the candle hand-off channel from the
// aggregator to the composer.
//
// Thread safety:
//   - A single atomic running flag, polled by every loop each iteration.
//   - The aggregator guards its buffers with its own mutex.
//   - Queues are their own concurrency boundaries.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::market_data::TickAggregator;
use crate::market_hours::MarketHoursClock;
use crate::persistence::snapshots::insert_tick_candle_with_retry;
use crate::queues::BoundedQueue;
use crate::runtime_config::EngineConfig;
use crate::types::{ScoredImpact, SecondCandle, Tick};

/// Capacity of the global scored-impacts queue (drop-oldest on overflow).
const SCORED_IMPACTS_CAPACITY: usize = 500;
/// Capacity of the aggregator -> composer candle channel.
const CANDLE_CHANNEL_CAPACITY: usize = 64;

/// Shared pipeline context. Constructed once in main and passed to every
/// spawned worker as `Arc<PipelineState>`.
pub struct PipelineState {
    pub config: EngineConfig,
    pub clock: MarketHoursClock,

    /// Global shutdown flag. Cleared exactly once, by the orchestrator.
    pub running: AtomicBool,

    /// Owns the tick buffers and the processed-seconds set.
    pub aggregator: TickAggregator,

    /// Impacts from all sources, drained by the composer each second.
    pub scored_impacts: BoundedQueue<ScoredImpact>,

    /// Persistence pool; None runs the pipeline without durability.
    pub pool: Option<PgPool>,

    // ── Counters for the status loop ────────────────────────────────────
    pub ticks_ingested: AtomicU64,
    pub second_candles_emitted: AtomicU64,
    pub tick_candles_emitted: AtomicU64,
    pub snapshots_written: AtomicU64,

    pub start_time: std::time::Instant,

    candle_tx: mpsc::Sender<SecondCandle>,

    /// In-flight 100-tick candle saves. Tracked so shutdown can join them
    /// instead of letting the runtime abort a write mid-retry.
    tick_candle_saves: Mutex<JoinSet<()>>,
}

impl PipelineState {
    /// Build the shared state plus the composer's receiving end of the
    /// candle channel.
    pub fn new(
        config: EngineConfig,
        pool: Option<PgPool>,
    ) -> (Arc<Self>, mpsc::Receiver<SecondCandle>) {
        let clock = MarketHoursClock::new(config.skip_market_hours_check);
        let (candle_tx, candle_rx) = mpsc::channel(CANDLE_CHANNEL_CAPACITY);

        let state = Arc::new(Self {
            config,
            clock,
            running: AtomicBool::new(true),
            aggregator: TickAggregator::new(),
            scored_impacts: BoundedQueue::new(SCORED_IMPACTS_CAPACITY),
            pool,
            ticks_ingested: AtomicU64::new(0),
            second_candles_emitted: AtomicU64::new(0),
            tick_candles_emitted: AtomicU64::new(0),
            snapshots_written: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
            candle_tx,
            tick_candle_saves: Mutex::new(JoinSet::new()),
        });

        (state, candle_rx)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Synchronous tick entry point called from the stream's message
    /// handler. Folds the tick into both candle dimensions; a completed
    /// 100-tick candle is persisted immediately on a detached task so the
    /// handler never waits on the database.
    pub fn ingest_tick(&self, tick: Tick) {
        self.ticks_ingested.fetch_add(1, Ordering::Relaxed);

        let result = self.aggregator.ingest(tick);
        if let Some(candle) = result.tick_candle {
            self.tick_candles_emitted.fetch_add(1, Ordering::Relaxed);
            if let Some(pool) = self.pool.clone() {
                let symbol = self.config.instrument_symbol.clone();
                let mut saves = self.tick_candle_saves.lock();
                // Reap completed saves so the set only holds live tasks.
                while saves.try_join_next().is_some() {}
                saves.spawn(async move {
                    if let Err(e) = insert_tick_candle_with_retry(&pool, &symbol, &candle).await {
                        warn!(
                            sequence = candle.sequence,
                            error = %e,
                            "tick candle save failed, continuing"
                        );
                    }
                });
            }
        }
    }

    /// Join any tick-candle saves still in flight, up to `timeout`. Saves
    /// that outlive the deadline are aborted and counted in the log, the
    /// same way the save-queue drain is bounded.
    pub async fn drain_tick_candle_saves(&self, timeout: Duration) {
        let mut saves = std::mem::take(&mut *self.tick_candle_saves.lock());
        if saves.is_empty() {
            return;
        }

        let pending = saves.len();
        let drained = tokio::time::timeout(timeout, async {
            while saves.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => debug!(count = pending, "tick candle saves drained"),
            Err(_) => {
                warn!(
                    abandoned = saves.len(),
                    "tick candle saves still in flight at shutdown deadline, aborting"
                );
                saves.abort_all();
            }
        }
    }

    /// Hand a finalized second candle to the composer. Non-blocking: if the
    /// composer has fallen a full channel behind, the candle is dropped and
    /// the gap shows up as a missing snapshot, never as backpressure into
    /// the tick path.
    pub fn send_candle(&self, candle: SecondCandle) {
        self.second_candles_emitted.fetch_add(1, Ordering::Relaxed);
        match self.candle_tx.try_send(candle) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(candle)) => {
                warn!(
                    bucket_second = candle.bucket_second,
                    "composer channel full, dropping candle"
                );
            }
            Err(mpsc::error::TrySendError::Closed(candle)) => {
                debug!(
                    bucket_second = candle.bucket_second,
                    "composer channel closed, dropping candle"
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
    use crate::runtime_config::EngineConfig;

    fn test_config() -> EngineConfig {
        EngineConfig {
            instrument_symbol: "TQQQ".to_string(),
            tick_stream_api_key: String::new(),
            sentiment_provider: Default::default(),
            sentiment_api_key_fast: String::new(),
            sentiment_api_key_accurate: String::new(),
            company_news_api_key: String::new(),
            market_news_api_key: String::new(),
            enable_company_news: false,
            enable_market_news: false,
            enable_rss_news: false,
            rss_feeds: Default::default(),
            skip_market_hours_check: true,
            database_url: String::new(),
            weights: Default::default(),
            base_handover_max_age_secs: 70,
        }
    }

    #[tokio::test]
    async fn candles_flow_through_the_channel() {
        let (state, mut rx) = PipelineState::new(test_config(), None);

        state.send_candle(SecondCandle {
            bucket_second: 1,
            open: 85.0,
            high: 85.0,
            low: 85.0,
            close: 85.0,
            volume: 1.0,
            tick_count: 1,
        });

        let candle = rx.recv().await.unwrap();
        assert_eq!(candle.bucket_second, 1);
        assert_eq!(state.second_candles_emitted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn shutdown_flag_round_trip() {
        let (state, _rx) = PipelineState::new(test_config(), None);
        assert!(state.is_running());
        state.shutdown();
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn drain_tick_candle_saves_is_a_no_op_when_idle() {
        let (state, _rx) = PipelineState::new(test_config(), None);
        // Without a pool nothing is ever spawned; the drain returns at once.
        state
            .drain_tick_candle_saves(Duration::from_millis(100))
            .await;
        assert!(state.tick_candle_saves.lock().is_empty());
    }

    #[tokio::test]
    async fn drain_tick_candle_saves_joins_pending_tasks() {
        let (state, _rx) = PipelineState::new(test_config(), None);
        state.tick_candle_saves.lock().spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        state
            .drain_tick_candle_saves(Duration::from_secs(1))
            .await;
        assert!(state.tick_candle_saves.lock().is_empty());
    }

    #[tokio::test]
    async fn ingest_tick_counts_and_aggregates() {
        let (state, _rx) = PipelineState::new(test_config(), None);
        state.ingest_tick(Tick {
            timestamp_ms: 1_700_000_000_500,
            price: 85.0,
            volume: 2.0,
        });
        assert_eq!(state.ticks_ingested.load(Ordering::Relaxed), 1);
        assert_eq!(state.aggregator.open_seconds(), 1);
    }
}
