// =============================================================================
// Database — PgPool construction and idempotent schema bootstrap
// =============================================================================

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Connect to the canonical store. Callers treat a failure here as
/// "persistence disabled", not a process abort.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    if database_url.is_empty() {
        anyhow::bail!("DATABASE_URL is not set");
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("failed to connect to database")?;

    info!("database pool ready");
    Ok(pool)
}

/// Create the pipeline's tables and indexes if they do not exist. Safe to run
/// on every startup.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS article (
            hash                  TEXT PRIMARY KEY,
            source                TEXT NOT NULL,
            symbol                TEXT NOT NULL,
            headline              TEXT NOT NULL,
            summary               TEXT NOT NULL DEFAULT '',
            url                   TEXT NOT NULL,
            publish_time          TIMESTAMPTZ NOT NULL,
            sentiment             DOUBLE PRECISION NOT NULL,
            impact                DOUBLE PRECISION NOT NULL,
            weighted_contribution DOUBLE PRECISION NOT NULL,
            fetched_at            TIMESTAMPTZ NOT NULL,
            created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            analyzed              BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS minute_row (
            id               BIGSERIAL PRIMARY KEY,
            timestamp        TIMESTAMPTZ NOT NULL,
            composite        DOUBLE PRECISION NOT NULL,
            news             DOUBLE PRECISION NOT NULL,
            reddit           DOUBLE PRECISION NOT NULL,
            technical        DOUBLE PRECISION NOT NULL,
            analyst          DOUBLE PRECISION NOT NULL,
            label            TEXT NOT NULL,
            article_count    INTEGER NOT NULL DEFAULT 0,
            cached_count     INTEGER NOT NULL DEFAULT 0,
            new_count        INTEGER NOT NULL DEFAULT 0,
            price            DOUBLE PRECISION NOT NULL DEFAULT 0,
            price_change_pct DOUBLE PRECISION NOT NULL DEFAULT 0,
            rsi_14           DOUBLE PRECISION,
            macd             DOUBLE PRECISION,
            vix              DOUBLE PRECISION
        )
        "#,
        r#"CREATE INDEX IF NOT EXISTS idx_minute_row_timestamp ON minute_row (timestamp DESC)"#,
        r#"
        CREATE TABLE IF NOT EXISTS second_snapshot (
            id                BIGSERIAL PRIMARY KEY,
            instrument_symbol TEXT NOT NULL,
            bucket_second     BIGINT NOT NULL,
            composite         DOUBLE PRECISION NOT NULL,
            news_cached       DOUBLE PRECISION NOT NULL,
            technical_cached  DOUBLE PRECISION NOT NULL,
            open              DOUBLE PRECISION NOT NULL,
            high              DOUBLE PRECISION NOT NULL,
            low               DOUBLE PRECISION NOT NULL,
            close             DOUBLE PRECISION NOT NULL,
            volume            DOUBLE PRECISION NOT NULL DEFAULT 0,
            tick_count        INTEGER NOT NULL DEFAULT 0,
            UNIQUE (instrument_symbol, bucket_second)
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_second_snapshot_latest
            ON second_snapshot (instrument_symbol, bucket_second DESC)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS tick_candle (
            id                BIGSERIAL PRIMARY KEY,
            instrument_symbol TEXT NOT NULL,
            sequence          BIGINT NOT NULL,
            first_tick_ms     BIGINT NOT NULL,
            last_tick_ms      BIGINT NOT NULL,
            duration_secs     DOUBLE PRECISION NOT NULL,
            open              DOUBLE PRECISION NOT NULL,
            high              DOUBLE PRECISION NOT NULL,
            low               DOUBLE PRECISION NOT NULL,
            close             DOUBLE PRECISION NOT NULL,
            volume            DOUBLE PRECISION NOT NULL,
            tick_count        INTEGER NOT NULL
        )
        "#,
    ];

    for stmt in statements {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("schema bootstrap statement failed")?;
    }

    info!("database schema ensured");
    Ok(())
}
