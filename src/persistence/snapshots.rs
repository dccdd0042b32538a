// =============================================================================
// Snapshot & Minute-Row Store — the dual-table persistence adapter
// =============================================================================
//
// Two write paths share this module:
//   - The composer appends one second_snapshot per bucket-second (best-effort,
//     bounded retry, never blocks the aggregator).
//   - The external minute analyzer inserts minute_row entries; when the
//     per-second loop is active it additionally mirrors the new base into a
//     snapshot so the composer hands over without a discontinuity.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::warn;

use crate::persistence::articles::{classify, DbErrorClass, SAVE_MAX_ATTEMPTS, SAVE_RETRY_BACKOFFS};
use crate::types::{MinuteRow, SecondSnapshot, TickCandle100};

/// Latest minute row, newest first. One indexed lookup.
pub async fn latest_minute_row(pool: &PgPool) -> Result<Option<MinuteRow>, sqlx::Error> {
    sqlx::query_as::<_, MinuteRow>(
        r#"
        SELECT id, timestamp, composite, news, reddit, technical, analyst,
               label, article_count, cached_count, new_count,
               price, price_change_pct, rsi_14, macd, vix
        FROM minute_row
        ORDER BY timestamp DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await
}

/// Latest per-second snapshot for the instrument.
pub async fn latest_second_snapshot(
    pool: &PgPool,
    instrument_symbol: &str,
) -> Result<Option<SecondSnapshot>, sqlx::Error> {
    sqlx::query_as::<_, SecondSnapshot>(
        r#"
        SELECT instrument_symbol, bucket_second, composite, news_cached,
               technical_cached, open, high, low, close, volume, tick_count
        FROM second_snapshot
        WHERE instrument_symbol = $1
        ORDER BY bucket_second DESC
        LIMIT 1
        "#,
    )
    .bind(instrument_symbol)
    .fetch_optional(pool)
    .await
}

/// Append one snapshot. The (instrument, bucket_second) unique key makes the
/// write idempotent; a conflicting row is refreshed, not duplicated.
pub async fn insert_second_snapshot(
    pool: &PgPool,
    snapshot: &SecondSnapshot,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO second_snapshot (
            instrument_symbol, bucket_second, composite, news_cached,
            technical_cached, open, high, low, close, volume, tick_count
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (instrument_symbol, bucket_second)
        DO UPDATE SET
            composite = EXCLUDED.composite,
            news_cached = EXCLUDED.news_cached,
            technical_cached = EXCLUDED.technical_cached,
            open = EXCLUDED.open,
            high = EXCLUDED.high,
            low = EXCLUDED.low,
            close = EXCLUDED.close,
            volume = EXCLUDED.volume,
            tick_count = EXCLUDED.tick_count
        "#,
    )
    .bind(&snapshot.instrument_symbol)
    .bind(snapshot.bucket_second)
    .bind(snapshot.composite)
    .bind(snapshot.news_cached)
    .bind(snapshot.technical_cached)
    .bind(snapshot.open)
    .bind(snapshot.high)
    .bind(snapshot.low)
    .bind(snapshot.close)
    .bind(snapshot.volume)
    .bind(snapshot.tick_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Snapshot write with the standard 100/200/400 ms retry ladder on
/// transient errors. The composer calls this and logs-and-moves-on when it
/// fails.
pub async fn insert_second_snapshot_with_retry(
    pool: &PgPool,
    snapshot: &SecondSnapshot,
) -> Result<()> {
    retry_write("second_snapshot", || insert_second_snapshot(pool, snapshot)).await
}

/// Persist one 100-tick candle.
pub async fn insert_tick_candle(
    pool: &PgPool,
    instrument_symbol: &str,
    candle: &TickCandle100,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO tick_candle (
            instrument_symbol, sequence, first_tick_ms, last_tick_ms,
            duration_secs, open, high, low, close, volume, tick_count
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(instrument_symbol)
    .bind(candle.sequence as i64)
    .bind(candle.first_tick_ms)
    .bind(candle.last_tick_ms)
    .bind(candle.duration_secs)
    .bind(candle.open)
    .bind(candle.high)
    .bind(candle.low)
    .bind(candle.close)
    .bind(candle.volume)
    .bind(candle.tick_count as i32)
    .execute(pool)
    .await?;

    Ok(())
}

/// Tick-candle write with the standard retry ladder.
pub async fn insert_tick_candle_with_retry(
    pool: &PgPool,
    instrument_symbol: &str,
    candle: &TickCandle100,
) -> Result<()> {
    retry_write("tick_candle", || {
        insert_tick_candle(pool, instrument_symbol, candle)
    })
    .await
}

/// Insert a minute row (the external analyzer's write path). When the latest
/// snapshot is younger than `handover_max_age_secs`, a mirror snapshot
/// carrying the new base is written too, so the per-second loop picks up the
/// fresh minute components without waiting out its cache age.
///
/// The mirror write is best-effort: its failure does not fail the minute row.
pub async fn insert_minute_row(
    pool: &PgPool,
    row: &MinuteRow,
    instrument_symbol: &str,
    handover_max_age_secs: i64,
) -> Result<i64, sqlx::Error> {
    let id: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO minute_row (
            timestamp, composite, news, reddit, technical, analyst, label,
            article_count, cached_count, new_count, price, price_change_pct,
            rsi_14, macd, vix
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING id
        "#,
    )
    .bind(row.timestamp)
    .bind(row.composite)
    .bind(row.news)
    .bind(row.reddit)
    .bind(row.technical)
    .bind(row.analyst)
    .bind(&row.label)
    .bind(row.article_count)
    .bind(row.cached_count)
    .bind(row.new_count)
    .bind(row.price)
    .bind(row.price_change_pct)
    .bind(row.rsi_14)
    .bind(row.macd)
    .bind(row.vix)
    .fetch_one(pool)
    .await?;

    let per_second_active = match latest_second_snapshot(pool, instrument_symbol).await? {
        Some(latest) => {
            let age = Utc::now().timestamp() - latest.bucket_second;
            age <= handover_max_age_secs
        }
        None => false,
    };

    if per_second_active {
        let mirror = SecondSnapshot {
            instrument_symbol: instrument_symbol.to_string(),
            bucket_second: row.timestamp.timestamp(),
            composite: row.composite,
            news_cached: row.news,
            technical_cached: row.technical,
            open: row.price,
            high: row.price,
            low: row.price,
            close: row.price,
            volume: 0.0,
            tick_count: 0,
        };
        if let Err(e) = insert_second_snapshot(pool, &mirror).await {
            warn!(error = %e, "minute-row snapshot mirror failed");
        }
    }

    Ok(id.0)
}

/// Shared retry loop for snapshot-path writes.
async fn retry_write<F, Fut>(label: &str, mut write: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
{
    let mut last_err: Option<sqlx::Error> = None;

    for attempt in 0..SAVE_MAX_ATTEMPTS {
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let class = classify(&e);
                warn!(
                    table = label,
                    attempt = attempt + 1,
                    class = ?class,
                    error = %e,
                    "write attempt failed"
                );
                if class == DbErrorClass::Permanent {
                    return Err(e.into());
                }
                last_err = Some(e);
                if let Some(backoff) = SAVE_RETRY_BACKOFFS.get(attempt) {
                    tokio::time::sleep(*backoff).await;
                }
            }
        }
    }

    Err(last_err
        .map(Into::into)
        .unwrap_or_else(|| anyhow::anyhow!("{label} write failed with no recorded error")))
}
