// =============================================================================
// Market-Hours Clock — exchange-calendar gating for the tick pipeline
// =============================================================================
//
// Regular session only: 09:30-16:00 America/New_York, Monday through Friday.
// Holidays are not modelled; a holiday simply produces no ticks and the
// stream supervisor idles on its stall/reconnect cycle.
//
// Fail-safe: any timezone conversion the tz database cannot resolve (DST
// gaps) is treated as closed.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use tracing::{debug, info};

/// Maximum sleep between re-checks while waiting for the market to open.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(300);

/// Clock that answers "is the instrument's market open right now".
#[derive(Debug, Clone)]
pub struct MarketHoursClock {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    /// Test override: report always-open.
    skip_hours: bool,
}

impl MarketHoursClock {
    pub fn new(skip_hours: bool) -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).expect("valid open time"),
            close: NaiveTime::from_hms_opt(16, 0, 0).expect("valid close time"),
            skip_hours,
        }
    }

    /// True when `now` falls inside the regular session.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.skip_hours {
            return true;
        }

        let local = now.with_timezone(&self.tz);
        if is_weekend(local.weekday()) {
            return false;
        }

        let t = local.time();
        t >= self.open && t < self.close
    }

    /// The next session-open instant strictly after `now`.
    pub fn next_open_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.tz);
        let mut day = local.date_naive();

        // If today's open is already behind us (or today is a weekend), walk
        // forward to the next trading day.
        if local.time() >= self.open || is_weekend(local.weekday()) {
            day = day.succ_opt().unwrap_or(day);
        }
        while is_weekend(day.weekday()) {
            day = day.succ_opt().unwrap_or(day);
        }

        match day.and_time(self.open).and_local_timezone(self.tz) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            // DST gap at the open (never happens for 09:30, but the clock
            // must not panic): fall back to a fixed re-check horizon.
            chrono::LocalResult::None => now + ChronoDuration::seconds(300),
        }
    }

    /// Sleep until the market opens, waking at most every five minutes to
    /// re-check the clock and the shutdown flag. Returns false if shutdown
    /// was requested while waiting.
    pub async fn block_until_open(&self, running: &AtomicBool) -> bool {
        loop {
            if !running.load(Ordering::Relaxed) {
                return false;
            }
            let now = Utc::now();
            if self.is_open(now) {
                return true;
            }

            let next_open = self.next_open_after(now);
            let remaining = (next_open - now)
                .to_std()
                .unwrap_or(Duration::from_secs(1));
            let slice = remaining.min(MAX_WAIT_SLICE);

            if remaining > MAX_WAIT_SLICE {
                debug!(
                    next_open = %next_open,
                    remaining_secs = remaining.as_secs(),
                    "market closed, sleeping"
                );
            } else {
                info!(next_open = %next_open, "market opens soon");
            }
            tokio::time::sleep(slice).await;
        }
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> MarketHoursClock {
        MarketHoursClock::new(false)
    }

    /// 2024-01-10 is a Wednesday; EST (UTC-5) applies in January.
    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn open_during_regular_session() {
        // 10:00 ET == 15:00 UTC in January.
        assert!(clock().is_open(utc(2024, 1, 10, 15, 0)));
    }

    #[test]
    fn closed_before_open_and_after_close() {
        // 09:00 ET.
        assert!(!clock().is_open(utc(2024, 1, 10, 14, 0)));
        // 16:00 ET exactly: session is half-open [09:30, 16:00).
        assert!(!clock().is_open(utc(2024, 1, 10, 21, 0)));
    }

    #[test]
    fn closed_on_weekend() {
        // 2024-01-13 is a Saturday.
        assert!(!clock().is_open(utc(2024, 1, 13, 15, 0)));
    }

    #[test]
    fn skip_hours_forces_open() {
        let c = MarketHoursClock::new(true);
        assert!(c.is_open(utc(2024, 1, 13, 3, 0)));
    }

    #[test]
    fn next_open_same_day_before_open() {
        // 08:00 ET Wednesday -> 09:30 ET the same day (14:30 UTC).
        let next = clock().next_open_after(utc(2024, 1, 10, 13, 0));
        assert_eq!(next, utc(2024, 1, 10, 14, 30));
    }

    #[test]
    fn next_open_rolls_past_weekend() {
        // Friday 2024-01-12 at 17:00 ET -> Monday 2024-01-15 09:30 ET.
        let next = clock().next_open_after(utc(2024, 1, 12, 22, 0));
        assert_eq!(next, utc(2024, 1, 15, 14, 30));
    }

    #[test]
    fn next_open_during_session_is_next_day() {
        // 10:00 ET Wednesday -> Thursday 09:30 ET.
        let next = clock().next_open_after(utc(2024, 1, 10, 15, 0));
        assert_eq!(next, utc(2024, 1, 11, 14, 30));
    }

    #[test]
    fn dst_switch_is_handled() {
        // 2024-03-11, the Monday after the spring-forward: EDT (UTC-4).
        // 10:00 ET == 14:00 UTC.
        assert!(clock().is_open(utc(2024, 3, 11, 14, 0)));
        // 09:00 ET == 13:00 UTC is before the open.
        assert!(!clock().is_open(utc(2024, 3, 11, 13, 0)));
    }
}
