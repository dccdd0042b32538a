// =============================================================================
// Article Store — hash-keyed upsert with transient-error retry
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tracing::warn;

use crate::types::Article;

/// Backoff ladder between save attempts: one gap per retry.
pub const SAVE_RETRY_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
];
/// Tries per save: the initial attempt plus one retry per backoff step.
pub const SAVE_MAX_ATTEMPTS: usize = 4;

/// Whether a failed write is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorClass {
    Transient,
    Permanent,
}

/// Classify a sqlx error. Connection-level failures, deadlocks, serialization
/// aborts, and unique-key races (two workers inserting the same hash) retry;
/// everything else fails the attempt for good.
pub fn classify(error: &sqlx::Error) -> DbErrorClass {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DbErrorClass::Transient,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // 40001 serialization_failure, 40P01 deadlock_detected,
            // 23505 unique_violation (concurrent insert of the same hash).
            Some("40001") | Some("40P01") | Some("23505") => DbErrorClass::Transient,
            _ => DbErrorClass::Permanent,
        },
        _ => DbErrorClass::Permanent,
    }
}

/// Upsert one scored article keyed on its hash. `created_at` is assigned by
/// the database on first insert only; re-saves update the scoring fields.
pub async fn upsert_article(pool: &PgPool, article: &Article) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO article (
            hash, source, symbol, headline, summary, url, publish_time,
            sentiment, impact, weighted_contribution, fetched_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (hash)
        DO UPDATE SET
            sentiment = EXCLUDED.sentiment,
            impact = EXCLUDED.impact,
            weighted_contribution = EXCLUDED.weighted_contribution
        "#,
    )
    .bind(&article.hash)
    .bind(&article.source)
    .bind(&article.symbol)
    .bind(&article.headline)
    .bind(&article.summary)
    .bind(&article.url)
    .bind(article.published_at)
    .bind(article.sentiment.unwrap_or(0.0))
    .bind(article.impact.unwrap_or(0.0))
    .bind(article.weighted_contribution.unwrap_or(0.0))
    .bind(article.fetched_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Upsert with the standard retry budget. Transient failures back off
/// 100 ms -> 200 ms -> 400 ms between tries; permanent failures return
/// immediately.
pub async fn save_article_with_retry(pool: &PgPool, article: &Article) -> Result<()> {
    let mut last_err: Option<sqlx::Error> = None;

    for attempt in 0..SAVE_MAX_ATTEMPTS {
        match upsert_article(pool, article).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let class = classify(&e);
                warn!(
                    hash = %article.hash,
                    attempt = attempt + 1,
                    class = ?class,
                    error = %e,
                    "NEWSSAVING article save attempt failed"
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
        .unwrap_or_else(|| anyhow::anyhow!("article save failed with no recorded error")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let e = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify(&e), DbErrorClass::Transient);
        assert_eq!(classify(&sqlx::Error::PoolTimedOut), DbErrorClass::Transient);
    }

    #[test]
    fn row_not_found_is_permanent() {
        assert_eq!(classify(&sqlx::Error::RowNotFound), DbErrorClass::Permanent);
    }
}
