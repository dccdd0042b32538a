// =============================================================================
// Scoring Worker — one per source, turns articles into live impacts
// =============================================================================
//
// Ordering contract: the impact is pushed onto the global scored_impacts
// queue BEFORE the save is enqueued. A slow or failing save path can delay
// durability, never the price-sentiment signal.
//
// A provider failure drops the article without caching anything; the dedup
// TTL guarantees it can be rediscovered and rescored.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::app_state::PipelineState;
use crate::news::collector::SourceContext;
use crate::persistence::save_worker::SaveJob;
use crate::scoring::impact::compute_impact;
use crate::scoring::provider::{ScoreRequest, SentimentScorer};
use crate::types::ScoredImpact;

/// Poll timeout on the to-score queue; bounds how long the worker can go
/// without observing the shutdown flag.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Run one source's scoring worker until shutdown.
pub async fn run_scoring_worker(
    state: Arc<PipelineState>,
    ctx: Arc<SourceContext>,
    scorer: Arc<dyn SentimentScorer>,
) {
    info!(
        source = ctx.name,
        provider = scorer.name(),
        "scoring worker started"
    );

    while state.is_running() {
        let Some(article) = ctx.to_score.pop_timeout(POP_TIMEOUT).await else {
            continue;
        };

        let request = ScoreRequest {
            headline: article.headline.clone(),
            summary: article.summary.clone(),
        };

        let sentiment = match scorer.score(&[request]).await {
            Ok(values) if values.len() == 1 => values[0],
            Ok(values) => {
                warn!(
                    source = ctx.name,
                    got = values.len(),
                    "provider returned wrong sentiment count, dropping article"
                );
                continue;
            }
            Err(e) => {
                // Deliberately no caching of a fallback score: the article
                // will come back through the collector once the dedup entry
                // expires.
                warn!(
                    source = ctx.name,
                    hash = %article.hash,
                    error = %e,
                    "scoring failed after all attempts, dropping article"
                );
                continue;
            }
        };

        let weight = state.config.weights.weight_for(&article.symbol);
        let (weighted, impact) = compute_impact(sentiment, weight);

        debug!(
            source = ctx.name,
            symbol = %article.symbol,
            sentiment = format!("{sentiment:.3}"),
            weight,
            impact = format!("{impact:.2}"),
            "article scored"
        );

        // Impact first: the composer must see it next second regardless of
        // save latency.
        let evicted = state.scored_impacts.push_drop_oldest(ScoredImpact {
            source: article.source.clone(),
            hash: article.hash.clone(),
            impact,
            scored_at: Utc::now(),
        });
        if let Some(old) = evicted {
            warn!(
                source = ctx.name,
                evicted_hash = %old.hash,
                "scored_impacts queue full, dropped oldest impact"
            );
        }

        let mut scored = article;
        scored.sentiment = Some(sentiment);
        scored.impact = Some(impact);
        scored.weighted_contribution = Some(weighted);

        if let Err(job) = ctx.to_save.try_push(SaveJob::new(scored)) {
            warn!(
                source = ctx.name,
                hash = %job.article.hash,
                "SAVEQUEUE QUEUE_FULL: rejecting save, impact already applied"
            );
        }
    }

    info!(source = ctx.name, "scoring worker stopped");
}
