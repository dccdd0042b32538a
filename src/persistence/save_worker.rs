// =============================================================================
// Save Worker — per-source durable article persistence
// =============================================================================
//
// One dedicated worker per source drains that source's to_save queue. A hard
// 60 s deadline from enqueue bounds how long a job may sit behind a slow
// database; past it the job is dropped (the impact has long since been
// applied to the live score) and counted.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::app_state::PipelineState;
use crate::news::collector::SourceContext;
use crate::news::sanitize::sanitize_article;
use crate::persistence::articles::save_article_with_retry;
use crate::types::Article;

/// Hard ceiling on job age, measured from enqueue.
const SAVE_DEADLINE: Duration = Duration::from_secs(60);
/// Poll timeout on the to-save queue.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// A queued durable-save request.
pub struct SaveJob {
    pub article: Article,
    pub enqueued_at: Instant,
}

impl SaveJob {
    pub fn new(article: Article) -> Self {
        Self {
            article,
            enqueued_at: Instant::now(),
        }
    }
}

/// Outcome counters for one save worker, reported at shutdown.
#[derive(Default)]
pub struct SaveStats {
    pub success: AtomicU64,
    pub failed: AtomicU64,
    pub deadline: AtomicU64,
}

impl SaveStats {
    pub fn summary(&self) -> String {
        format!(
            "SUCCESS {} | FAILED {} | DEADLINE {}",
            self.success.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.deadline.load(Ordering::Relaxed),
        )
    }
}

/// Run one source's save worker. After shutdown is signalled the worker keeps
/// draining until its queue is empty (the orchestrator bounds the total drain
/// time).
pub async fn run_save_worker(
    state: Arc<PipelineState>,
    ctx: Arc<SourceContext>,
    pool: PgPool,
    stats: Arc<SaveStats>,
) {
    info!(source = ctx.name, "save worker started");

    loop {
        let Some(job) = ctx.to_save.pop_timeout(POP_TIMEOUT).await else {
            if !state.is_running() {
                break;
            }
            continue;
        };

        let age = job.enqueued_at.elapsed();
        if age > SAVE_DEADLINE {
            stats.deadline.fetch_add(1, Ordering::Relaxed);
            warn!(
                source = ctx.name,
                hash = %job.article.hash,
                age_secs = age.as_secs(),
                "SAVEQUEUE DEADLINE_EXCEEDED: dropping save, impact already applied"
            );
            continue;
        }

        let article = sanitize_article(job.article);

        match save_article_with_retry(&pool, &article).await {
            Ok(()) => {
                stats.success.fetch_add(1, Ordering::Relaxed);
                debug!(
                    source = ctx.name,
                    hash = %article.hash,
                    "NEWSSAVING article saved"
                );
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    source = ctx.name,
                    hash = %article.hash,
                    error = %e,
                    "NEWSSAVING SAVE_FAILED_ALL_ATTEMPTS"
                );
            }
        }
    }

    info!(source = ctx.name, summary = %stats.summary(), "save worker stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_summary_format() {
        let stats = SaveStats::default();
        stats.success.store(12, Ordering::Relaxed);
        stats.failed.store(1, Ordering::Relaxed);
        stats.deadline.store(3, Ordering::Relaxed);
        assert_eq!(stats.summary(), "SUCCESS 12 | FAILED 1 | DEADLINE 3");
    }
}
