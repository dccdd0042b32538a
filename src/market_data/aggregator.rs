// =============================================================================
// Tick Aggregator — exactly one candle per second, one per 100 ticks
// =============================================================================
//
// The aggregator owns the in-flight tick buffers and the processed-seconds
// set behind a single mutex. The message handler appends; the finalize loop
// (100 ms tick) closes every bucket-second that has fallen behind the wall
// clock; the 100-tick dimension closes purely on count.
//
// A tick for an already-processed second is a late tick: it skips the 1 s
// dimension but still counts toward the next 100-tick candle.
// =============================================================================

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{debug, info};

use crate::app_state::PipelineState;
use crate::types::{SecondCandle, Tick, TickCandle100};

/// Finalize-loop tick interval.
const FINALIZE_INTERVAL: Duration = Duration::from_millis(100);
/// Finalize-loop iterations between processed-set prunes.
const PRUNE_EVERY_ITERATIONS: u64 = 60;
/// Processed seconds older than this are forgotten.
const PROCESSED_RETENTION_SECS: i64 = 300;
/// Window size of the count-based candle dimension.
const TICKS_PER_CANDLE: usize = 100;

/// Result of folding one tick into the aggregator.
pub struct IngestResult {
    /// The tick's bucket-second was already finalized.
    pub late: bool,
    /// A 100-tick candle closed on this tick.
    pub tick_candle: Option<TickCandle100>,
}

struct AggregatorInner {
    /// Open per-second buffers, keyed by bucket-second (ordered).
    second_buffers: BTreeMap<i64, Vec<Tick>>,
    /// Bucket-seconds already finalized.
    processed: HashSet<i64>,
    /// Rolling buffer for the 100-tick dimension.
    rolling: VecDeque<Tick>,
    /// Next 100-tick candle sequence number.
    next_sequence: u64,
}

/// Owns all in-flight tick state. Shared by the stream's message handler and
/// the finalize loop; the mutex is never held across an await.
pub struct TickAggregator {
    inner: Mutex<AggregatorInner>,
}

impl TickAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AggregatorInner {
                second_buffers: BTreeMap::new(),
                processed: HashSet::new(),
                rolling: VecDeque::with_capacity(TICKS_PER_CANDLE + 16),
                next_sequence: 1,
            }),
        }
    }

    /// Fold one tick into both candle dimensions.
    pub fn ingest(&self, tick: Tick) -> IngestResult {
        let bucket = tick.bucket_second();
        let mut inner = self.inner.lock();

        let late = inner.processed.contains(&bucket);
        if late {
            debug!(
                bucket_second = bucket,
                price = tick.price,
                "LATE TICK: second already finalized, counting toward 100-tick candle only"
            );
        } else {
            inner.second_buffers.entry(bucket).or_default().push(tick);
        }

        inner.rolling.push_back(tick);
        let tick_candle = if inner.rolling.len() >= TICKS_PER_CANDLE {
            let window: Vec<Tick> = inner.rolling.drain(..TICKS_PER_CANDLE).collect();
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            Some(build_tick_candle(sequence, &window))
        } else {
            None
        };

        IngestResult { late, tick_candle }
    }

    /// Close every bucket-second strictly older than `now_second` that holds
    /// at least one tick. Returns the candles oldest-first and marks their
    /// seconds processed.
    pub fn finalize_due(&self, now_second: i64) -> Vec<SecondCandle> {
        let mut inner = self.inner.lock();

        let due: Vec<i64> = inner
            .second_buffers
            .range(..now_second)
            .map(|(bucket, _)| *bucket)
            .collect();

        let mut candles = Vec::with_capacity(due.len());
        for bucket in due {
            if let Some(ticks) = inner.second_buffers.remove(&bucket) {
                if let Some(candle) = SecondCandle::from_ticks(bucket, &ticks) {
                    candles.push(candle);
                }
                inner.processed.insert(bucket);
            }
        }
        candles
    }

    /// Drop processed-set entries older than `keep_after`.
    pub fn prune_processed(&self, keep_after: i64) {
        let mut inner = self.inner.lock();
        inner.processed.retain(|bucket| *bucket >= keep_after);
    }

    /// Number of bucket-seconds with open buffers.
    pub fn open_seconds(&self) -> usize {
        self.inner.lock().second_buffers.len()
    }

    /// Size of the processed-seconds set.
    pub fn processed_len(&self) -> usize {
        self.inner.lock().processed.len()
    }

    /// Ticks waiting in the 100-tick rolling buffer.
    pub fn rolling_len(&self) -> usize {
        self.inner.lock().rolling.len()
    }
}

impl Default for TickAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn build_tick_candle(sequence: u64, window: &[Tick]) -> TickCandle100 {
    let first = window.first().expect("window is never empty");
    let last = window.last().expect("window is never empty");

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    for t in window {
        if t.price > high {
            high = t.price;
        }
        if t.price < low {
            low = t.price;
        }
        volume += t.volume;
    }

    TickCandle100 {
        sequence,
        first_tick_ms: first.timestamp_ms,
        last_tick_ms: last.timestamp_ms,
        duration_secs: (last.timestamp_ms - first.timestamp_ms) as f64 / 1000.0,
        open: first.price,
        high,
        low,
        close: last.price,
        volume,
        tick_count: window.len() as u32,
    }
}

/// The second-finalize loop: every 100 ms, close any bucket-second that has
/// fallen behind the wall clock and hand its candle to the composer. On
/// shutdown it finalizes whatever is still in flight.
pub async fn run_second_loop(state: Arc<PipelineState>) {
    info!("second aggregation loop started");
    let mut ticker = interval(FINALIZE_INTERVAL);
    let mut iterations: u64 = 0;

    while state.is_running() {
        ticker.tick().await;
        iterations += 1;

        let now_second = Utc::now().timestamp();
        for candle in state.aggregator.finalize_due(now_second) {
            state.send_candle(candle);
        }

        if iterations % PRUNE_EVERY_ITERATIONS == 0 {
            state
                .aggregator
                .prune_processed(now_second - PROCESSED_RETENTION_SECS);
        }
    }

    // Shutdown: close the in-flight second(s) so the composer can drain them.
    for candle in state.aggregator.finalize_due(i64::MAX) {
        state.send_candle(candle);
    }
    info!("second aggregation loop stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ms: i64, price: f64) -> Tick {
        Tick {
            timestamp_ms: ms,
            price,
            volume: 1.0,
        }
    }

    #[test]
    fn one_candle_per_bucket_second() {
        let agg = TickAggregator::new();
        agg.ingest(tick(1_000, 85.0));
        agg.ingest(tick(1_500, 85.2));
        agg.ingest(tick(2_100, 85.1));

        // Second 1 is due once the clock reaches second 2.
        let candles = agg.finalize_due(2);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].bucket_second, 1);
        assert_eq!(candles[0].tick_count, 2);
        assert_eq!(candles[0].open, 85.0);
        assert_eq!(candles[0].close, 85.2);

        // Finalizing again for the same instant yields nothing.
        assert!(agg.finalize_due(2).is_empty());

        // Second 2 closes later.
        let candles = agg.finalize_due(3);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].bucket_second, 2);
    }

    #[test]
    fn late_tick_skips_second_dimension_only() {
        let agg = TickAggregator::new();
        agg.ingest(tick(1_000, 85.0));
        let _ = agg.finalize_due(2);

        let result = agg.ingest(tick(1_900, 85.5));
        assert!(result.late);

        // No new candle for second 1.
        assert!(agg.finalize_due(3).is_empty());
        // But the tick still sits in the rolling buffer.
        assert_eq!(agg.rolling_len(), 2);
    }

    #[test]
    fn empty_seconds_produce_no_candle() {
        let agg = TickAggregator::new();
        agg.ingest(tick(1_000, 85.0));
        agg.ingest(tick(5_000, 85.1));

        // Seconds 2-4 had no ticks; exactly two candles come out.
        let candles = agg.finalize_due(6);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].bucket_second, 1);
        assert_eq!(candles[1].bucket_second, 5);
    }

    #[test]
    fn hundredth_tick_closes_a_tick_candle() {
        let agg = TickAggregator::new();
        let mut emitted = Vec::new();
        for i in 0..250 {
            let result = agg.ingest(tick(i * 10, 85.0 + (i % 7) as f64 * 0.01));
            if let Some(c) = result.tick_candle {
                emitted.push(c);
            }
        }

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].sequence, 1);
        assert_eq!(emitted[1].sequence, 2);
        assert_eq!(emitted[0].tick_count, 100);
        assert!(emitted[0].last_tick_ms >= emitted[0].first_tick_ms);
        // The 50 leftover ticks wait for the next window.
        assert_eq!(agg.rolling_len(), 50);
    }

    #[test]
    fn tick_candle_ohlc_from_window() {
        let agg = TickAggregator::new();
        let mut candle = None;
        for i in 0..100 {
            let price = if i == 30 {
                90.0
            } else if i == 60 {
                80.0
            } else {
                85.0
            };
            if let Some(c) = agg.ingest(tick(i * 100, price)).tick_candle {
                candle = Some(c);
            }
        }
        let c = candle.unwrap();
        assert_eq!(c.open, 85.0);
        assert_eq!(c.close, 85.0);
        assert_eq!(c.high, 90.0);
        assert_eq!(c.low, 80.0);
        assert!((c.duration_secs - 9.9).abs() < 1e-9);
    }

    #[test]
    fn prune_keeps_recent_processed_entries() {
        let agg = TickAggregator::new();
        for s in 0..10 {
            agg.ingest(tick(s * 1000 + 100, 85.0));
        }
        let _ = agg.finalize_due(100);
        assert_eq!(agg.processed_len(), 10);

        agg.prune_processed(5);
        assert_eq!(agg.processed_len(), 5);
    }
}
