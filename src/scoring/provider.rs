// =============================================================================
// Sentiment Providers — pluggable scoring backends behind one capability
// =============================================================================
//
// Two implementations selected once at startup from SENTIMENT_PROVIDER:
//   fast     — one HTTP call per batch, escalating attempt timeouts
//   accurate — one HTTP call per article with a small bounded fan-out
//
// Both return sentiments in [-1, +1] or fail. A failure is a failure: the
// caller drops the article and the dedup TTL allows rediscovery. No variant
// ever substitutes 0.0 for an unknown score.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One text to score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest {
    pub headline: String,
    pub summary: String,
}

/// Capability interface for sentiment scoring.
#[async_trait]
pub trait SentimentScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score a batch of texts. The result has exactly one sentiment per
    /// request, each in [-1, +1].
    async fn score(&self, batch: &[ScoreRequest]) -> Result<Vec<f64>>;
}

fn validate_sentiments(values: &[f64], expected: usize) -> Result<()> {
    if values.len() != expected {
        anyhow::bail!(
            "provider returned {} sentiments for {} texts",
            values.len(),
            expected
        );
    }
    for &v in values {
        if !v.is_finite() || !(-1.0..=1.0).contains(&v) {
            anyhow::bail!("provider returned out-of-range sentiment {v}");
        }
    }
    Ok(())
}

/// Run `attempt` up to `timeouts.len()` times, with the given per-attempt
/// timeout and an inter-attempt backoff. Returns the last error when every
/// attempt fails.
async fn with_retries<F, Fut>(
    label: &str,
    timeouts: &[Duration],
    backoffs: &[Duration],
    mut attempt: F,
) -> Result<Vec<f64>>
where
    F: FnMut(Duration) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<f64>>>,
{
    let mut last_err = anyhow::anyhow!("no scoring attempts made");
    for (i, &timeout) in timeouts.iter().enumerate() {
        match tokio::time::timeout(timeout, attempt(timeout)).await {
            Ok(Ok(values)) => return Ok(values),
            Ok(Err(e)) => {
                warn!(provider = label, attempt = i + 1, error = %e, "scoring attempt failed");
                last_err = e;
            }
            Err(_) => {
                warn!(
                    provider = label,
                    attempt = i + 1,
                    timeout_secs = timeout.as_secs(),
                    "scoring attempt timed out"
                );
                last_err = anyhow::anyhow!("scoring timed out after {}s", timeout.as_secs());
            }
        }
        if let Some(&backoff) = backoffs.get(i) {
            tokio::time::sleep(backoff).await;
        }
    }
    Err(last_err)
}

// =============================================================================
// Fast provider — batch endpoint
// =============================================================================

const FAST_DEFAULT_URL: &str = "https://sentiment-fast.internal/v1/score";
const FAST_TIMEOUTS: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(45),
    Duration::from_secs(60),
];
const FAST_BACKOFFS: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];

#[derive(Debug, Deserialize)]
struct BatchScoreResponse {
    sentiments: Vec<f64>,
}

pub struct FastProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl FastProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let endpoint =
            std::env::var("SENTIMENT_API_URL_FAST").unwrap_or_else(|_| FAST_DEFAULT_URL.into());
        Self {
            // Per-attempt timeouts are applied by the retry helper; the
            // client itself carries no global deadline.
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint,
        }
    }

    async fn call(&self, batch: &[ScoreRequest]) -> Result<Vec<f64>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "texts": batch }))
            .send()
            .await
            .context("fast sentiment request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("fast sentiment API returned {status}");
        }

        let body: BatchScoreResponse = resp
            .json()
            .await
            .context("failed to parse fast sentiment response")?;
        validate_sentiments(&body.sentiments, batch.len())?;
        Ok(body.sentiments)
    }
}

#[async_trait]
impl SentimentScorer for FastProvider {
    fn name(&self) -> &'static str {
        "fast"
    }

    async fn score(&self, batch: &[ScoreRequest]) -> Result<Vec<f64>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let result =
            with_retries("fast", &FAST_TIMEOUTS, &FAST_BACKOFFS, |_t| self.call(batch)).await?;
        debug!(count = result.len(), "fast provider scored batch");
        Ok(result)
    }
}

// =============================================================================
// Accurate provider — per-article calls, bounded fan-out
// =============================================================================

const ACCURATE_DEFAULT_URL: &str = "https://sentiment-accurate.internal/v1/score";
const ACCURATE_TIMEOUTS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(15),
    Duration::from_secs(20),
];
const ACCURATE_BACKOFFS: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];
/// Maximum in-flight per-article requests.
const ACCURATE_MAX_PARALLEL: usize = 4;

#[derive(Debug, Deserialize)]
struct SingleScoreResponse {
    sentiment: f64,
}

pub struct AccurateProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl AccurateProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let endpoint = std::env::var("SENTIMENT_API_URL_ACCURATE")
            .unwrap_or_else(|_| ACCURATE_DEFAULT_URL.into());
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint,
        }
    }

    async fn call_one(&self, req: &ScoreRequest) -> Result<Vec<f64>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await
            .context("accurate sentiment request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("accurate sentiment API returned {status}");
        }

        let body: SingleScoreResponse = resp
            .json()
            .await
            .context("failed to parse accurate sentiment response")?;
        let values = vec![body.sentiment];
        validate_sentiments(&values, 1)?;
        Ok(values)
    }
}

#[async_trait]
impl SentimentScorer for AccurateProvider {
    fn name(&self) -> &'static str {
        "accurate"
    }

    async fn score(&self, batch: &[ScoreRequest]) -> Result<Vec<f64>> {
        // `buffered` preserves input order, so sentiments line up with the
        // batch even though up to ACCURATE_MAX_PARALLEL calls are in flight.
        let mut futures: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<f64>>> + Send + '_>>,
        > = Vec::with_capacity(batch.len());
        for req in batch.iter() {
            futures.push(Box::pin(with_retries(
                "accurate",
                &ACCURATE_TIMEOUTS,
                &ACCURATE_BACKOFFS,
                move |_t| self.call_one(req),
            )));
        }
        let results: Vec<Vec<f64>> = stream::iter(futures)
            .buffered(ACCURATE_MAX_PARALLEL)
            .try_collect()
            .await?;

        Ok(results.into_iter().map(|v| v[0]).collect())
    }
}
