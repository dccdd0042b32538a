// =============================================================================
// Tick Stream Client — single upstream connection with fast stall detection
// =============================================================================
//
// Connection contract:
//   - subscribe with {"action":"subscribe","symbols":[SYMBOL]} after connect
//   - ping every 15 s, pong required within 5 s
//   - health check every 5 s; no tick for 15 s during market hours => close
//   - fast reconnect (2 s) after a connection that delivered data; capped
//     exponential backoff (2 -> 60 s) otherwise
//
// The supervisor re-checks market hours before every attempt and parks the
// whole client while the market is closed. Every close path funnels through
// DisconnectLog so concurrent teardowns produce exactly one log line.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, error, info, warn};

use crate::app_state::PipelineState;
use crate::types::{StreamError, Tick};

const DEFAULT_STREAM_URL: &str = "wss://ws.finnhub.io";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const STALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Fast-lane delay after a connection that received at least one tick.
const FAST_RECONNECT: Duration = Duration::from_secs(2);
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 60;

// =============================================================================
// Reconnect policy
// =============================================================================

/// Chooses the delay before the next connection attempt.
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    consecutive_failures: u32,
}

impl ReconnectPolicy {
    /// `delivered_data` means the previous connection was established and
    /// received at least one tick: it earns the 2 s fast lane and resets the
    /// failure streak. Anything else climbs the exponential ladder.
    pub fn next_delay(&mut self, delivered_data: bool) -> Duration {
        if delivered_data {
            self.consecutive_failures = 0;
            return FAST_RECONNECT;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let exp = self.consecutive_failures.min(6); // 2^6 * 2 already exceeds the cap
        let secs = BACKOFF_BASE_SECS
            .saturating_mul(1u64 << (exp - 1))
            .min(BACKOFF_CAP_SECS);
        Duration::from_secs(secs)
    }
}

// =============================================================================
// Consolidated disconnect logging
// =============================================================================

/// Guarantees one disconnect log line per connection even when several close
/// paths (read error, pong timeout, stall check) race. The atomic flag is the
/// fast path; the mutex plus a second check after acquire closes the race.
struct DisconnectLog {
    logged: AtomicBool,
    lock: Mutex<()>,
}

impl DisconnectLog {
    fn new() -> Self {
        Self {
            logged: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    fn log_once(&self, symbol: &str, reason: &str, ticks_received: u64, connected_secs: u64) {
        if self.logged.load(Ordering::Relaxed) {
            return;
        }
        let _guard = self.lock.lock();
        if self.logged.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            symbol = %symbol,
            reason = %reason,
            ticks_received,
            connected_secs,
            "tick stream disconnected"
        );
    }

    fn reset(&self) {
        self.logged.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Message parsing
// =============================================================================

/// Parse a tick message for `symbol`. Accepts both a bare tick object
/// `{"s":...,"p":...,"v":...,"t":...}` and the enveloped form
/// `{"type":"trade","data":[{...}, ...]}`. Non-trade frames yield an empty
/// vector rather than an error.
fn parse_tick_message(text: &str, symbol: &str) -> anyhow::Result<Vec<Tick>> {
    let root: serde_json::Value =
        serde_json::from_str(text).map_err(|e| anyhow::anyhow!("invalid tick JSON: {e}"))?;

    let items: Vec<&serde_json::Value> = if let Some(data) = root.get("data") {
        data.as_array().map(|a| a.iter().collect()).unwrap_or_default()
    } else if root.get("s").is_some() {
        vec![&root]
    } else {
        // Control frame (subscription ack, heartbeat): nothing to ingest.
        return Ok(Vec::new());
    };

    let mut ticks = Vec::with_capacity(items.len());
    for item in items {
        let s = item["s"].as_str().unwrap_or_default();
        if !s.eq_ignore_ascii_case(symbol) {
            continue;
        }
        let price = item["p"].as_f64().unwrap_or(0.0);
        let volume = item["v"].as_f64().unwrap_or(0.0);
        let timestamp_ms = item["t"].as_i64().unwrap_or(0);
        if price <= 0.0 || timestamp_ms <= 0 {
            debug!(raw = %item, "skipping malformed tick");
            continue;
        }
        ticks.push(Tick {
            timestamp_ms,
            price,
            volume,
        });
    }
    Ok(ticks)
}

// =============================================================================
// Connection lifecycle
// =============================================================================

/// Run one connection until it ends. Returns the tick count on any normal
/// close (the reason has already gone through the DisconnectLog); classified
/// errors bubble up for the supervisor's backoff decision.
async fn run_connection(
    state: &Arc<PipelineState>,
    url: &str,
    disconnect_log: &DisconnectLog,
) -> Result<u64, StreamError> {
    let symbol = state.config.instrument_symbol.clone();

    let connect_result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url)).await;
    let (ws_stream, _response) = match connect_result {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(classify_connect_error(e)),
        Err(_) => return Err(StreamError::StreamClosed("connect timeout".into())),
    };

    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "action": "subscribe",
        "symbols": [symbol],
    });
    write
        .send(tungstenite::Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| StreamError::StreamClosed(format!("subscribe send failed: {e}")))?;

    info!(symbol = %symbol, "tick stream connected and subscribed");

    let connected_at = Instant::now();
    let mut ticks_received: u64 = 0;
    let mut last_tick = Instant::now();
    let mut last_ping_sent = Instant::now();
    let mut awaiting_pong_since: Option<Instant> = None;
    let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);

    macro_rules! close_with {
        ($reason:expr) => {{
            disconnect_log.log_once(
                &symbol,
                $reason,
                ticks_received,
                connected_at.elapsed().as_secs(),
            );
            let _ = write.send(tungstenite::Message::Close(None)).await;
            return Ok(ticks_received);
        }};
    }

    loop {
        if !state.is_running() {
            close_with!("shutdown requested");
        }

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match parse_tick_message(&text, &symbol) {
                            Ok(ticks) => {
                                if !ticks.is_empty() {
                                    ticks_received += ticks.len() as u64;
                                    last_tick = Instant::now();
                                    for tick in ticks {
                                        state.ingest_tick(tick);
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to parse tick message");
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(payload))) => {
                        let _ = write.send(tungstenite::Message::Pong(payload)).await;
                    }
                    Some(Ok(tungstenite::Message::Pong(_))) => {
                        awaiting_pong_since = None;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) => {
                        close_with!("server close frame");
                    }
                    Some(Err(e)) => {
                        let reason = format!("read error: {e}");
                        disconnect_log.log_once(
                            &symbol,
                            &reason,
                            ticks_received,
                            connected_at.elapsed().as_secs(),
                        );
                        return Ok(ticks_received);
                    }
                    None => {
                        close_with!("stream ended");
                    }
                    _ => {}
                }
            }

            _ = health_check.tick() => {
                let now = Instant::now();

                if let Some(since) = awaiting_pong_since {
                    if now.duration_since(since) > PONG_TIMEOUT {
                        close_with!("pong timeout");
                    }
                }

                if now.duration_since(last_ping_sent) >= PING_INTERVAL {
                    if write
                        .send(tungstenite::Message::Ping(Vec::new()))
                        .await
                        .is_err()
                    {
                        close_with!("ping send failed");
                    }
                    last_ping_sent = now;
                    awaiting_pong_since = Some(now);
                }

                let market_open = state.clock.is_open(Utc::now());
                if market_open && now.duration_since(last_tick) > STALL_TIMEOUT {
                    close_with!("no data for 15s during market hours");
                }
                if !market_open {
                    close_with!("market closed");
                }
            }
        }
    }
}

/// Map a handshake failure onto the stream error taxonomy.
fn classify_connect_error(error: tungstenite::Error) -> StreamError {
    if let tungstenite::Error::Http(ref response) = error {
        let status = response.status();
        if status == 401 || status == 403 {
            return StreamError::AuthenticationFailed(format!("handshake rejected: {status}"));
        }
        if status == 429 {
            return StreamError::RateLimited(format!("handshake rejected: {status}"));
        }
    }
    StreamError::StreamClosed(format!("connect failed: {error}"))
}

// =============================================================================
// Supervisor
// =============================================================================

/// Market-hours-aware connection supervisor. Runs until shutdown or a fatal
/// authentication failure.
pub async fn run_stream_supervisor(state: Arc<PipelineState>) {
    if state.config.tick_stream_api_key.is_empty() {
        error!("TICK_STREAM_API_KEY not set, tick stream disabled");
        return;
    }

    let base_url =
        std::env::var("TICK_STREAM_URL").unwrap_or_else(|_| DEFAULT_STREAM_URL.to_string());
    let url = format!("{}?token={}", base_url, state.config.tick_stream_api_key);

    let mut policy = ReconnectPolicy::default();
    let disconnect_log = DisconnectLog::new();

    while state.is_running() {
        if !state.clock.is_open(Utc::now()) {
            info!("market closed, tick stream parked until next open");
            if !state.clock.block_until_open(&state.running).await {
                break;
            }
        }

        disconnect_log.reset();
        let delay = match run_connection(&state, &url, &disconnect_log).await {
            Ok(ticks) => policy.next_delay(ticks > 0),
            Err(StreamError::AuthenticationFailed(msg)) => {
                error!(error = %msg, "tick stream authentication failed, giving up");
                return;
            }
            Err(StreamError::RateLimited(msg)) => {
                warn!(error = %msg, "tick stream rate limited");
                policy.next_delay(false)
            }
            Err(StreamError::StreamClosed(msg)) => {
                warn!(error = %msg, "tick stream connection failed");
                policy.next_delay(false)
            }
        };

        if !state.is_running() {
            break;
        }
        debug!(delay_secs = delay.as_secs(), "reconnecting after delay");
        tokio::time::sleep(delay).await;
    }

    info!("tick stream supervisor stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_lane_after_data() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(true), Duration::from_secs(2));
        // The fast lane also resets any accumulated failures.
        policy.next_delay(false);
        policy.next_delay(false);
        assert_eq!(policy.next_delay(true), Duration::from_secs(2));
        assert_eq!(policy.next_delay(false), Duration::from_secs(2));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|_| policy.next_delay(false).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn parse_bare_tick_object() {
        let ticks =
            parse_tick_message(r#"{"s":"TQQQ","p":85.01,"v":120.0,"t":1700000000123}"#, "TQQQ")
                .unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].timestamp_ms, 1_700_000_000_123);
        assert!((ticks[0].price - 85.01).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_enveloped_trades() {
        let text = r#"{"type":"trade","data":[
            {"s":"TQQQ","p":85.0,"v":10,"t":1700000000000},
            {"s":"OTHER","p":1.0,"v":1,"t":1700000000001},
            {"s":"TQQQ","p":85.1,"v":5,"t":1700000000002}
        ]}"#;
        let ticks = parse_tick_message(text, "TQQQ").unwrap();
        assert_eq!(ticks.len(), 2);
        assert!((ticks[1].price - 85.1).abs() < f64::EPSILON);
    }

    #[test]
    fn control_frames_yield_no_ticks() {
        let ticks = parse_tick_message(r#"{"type":"subscribed"}"#, "TQQQ").unwrap();
        assert!(ticks.is_empty());
    }

    #[test]
    fn malformed_ticks_are_skipped() {
        let text = r#"{"type":"trade","data":[
            {"s":"TQQQ","p":0.0,"v":10,"t":1700000000000},
            {"s":"TQQQ","p":85.1,"v":5,"t":0}
        ]}"#;
        let ticks = parse_tick_message(text, "TQQQ").unwrap();
        assert!(ticks.is_empty());
    }

    #[test]
    fn disconnect_log_suppresses_duplicates() {
        let log = DisconnectLog::new();
        log.log_once("TQQQ", "first", 10, 60);
        // Second close path racing in: swallowed by the double-check.
        log.log_once("TQQQ", "second", 10, 60);
        assert!(log.logged.load(Ordering::Relaxed));

        log.reset();
        assert!(!log.logged.load(Ordering::Relaxed));
    }
}
