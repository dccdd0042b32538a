// =============================================================================
// Meridian Sentiment Engine — Main Entry Point
// =============================================================================
//
// Real-time market-sentiment pipeline for a single leveraged index ETF:
// tick stream -> candle aggregation -> per-second composite score, fed by
// three news collectors with async scoring and durable saves.
//
// Subsystems are capability-gated: a missing credential or an unreachable
// database disables the owning component and the rest of the pipeline runs.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_engine::app_state::PipelineState;
use meridian_engine::news::collector::{NewsSource, SourceContext};
use meridian_engine::news::{CompanyNewsSource, MarketNewsSource, RssNewsSource};
use meridian_engine::persistence::SaveStats;
use meridian_engine::runtime_config::{EngineConfig, SentimentProviderKind};
use meridian_engine::scoring::{AccurateProvider, FastProvider, SentimentScorer};
use meridian_engine::{composer, market_data, news, persistence, scoring};

/// Upper bound on the post-shutdown save-queue drain.
const SAVE_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Sentiment Engine — Starting Up          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::from_env();

    // ── 2. Persistence ───────────────────────────────────────────────────
    let pool = match persistence::connect(&config.database_url).await {
        Ok(pool) => match persistence::ensure_schema(&pool).await {
            Ok(()) => Some(pool),
            Err(e) => {
                error!(error = %e, "schema bootstrap failed, persistence disabled");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "database unavailable, running without persistence");
            None
        }
    };

    // ── 3. Shared state ──────────────────────────────────────────────────
    let (state, candle_rx) = PipelineState::new(config, pool);

    // ── 4. Sentiment scorer ──────────────────────────────────────────────
    let scorer = build_scorer(&state.config);
    if scorer.is_none() {
        warn!("no sentiment provider credential, article scoring disabled");
    }

    // ── 5. News collector fleet ──────────────────────────────────────────
    let mut sources: Vec<(Arc<SourceContext>, Arc<dyn NewsSource>)> = Vec::new();

    if state.config.enable_company_news {
        if state.config.company_news_api_key.is_empty() {
            warn!("COMPANY_NEWS_API_KEY not set, company news collector disabled");
        } else {
            sources.push((
                SourceContext::new("company"),
                Arc::new(CompanyNewsSource::new(
                    state.config.company_news_api_key.clone(),
                    state.config.weights.watchlist(),
                )),
            ));
        }
    }
    if state.config.enable_market_news {
        if state.config.market_news_api_key.is_empty() {
            warn!("MARKET_NEWS_API_KEY not set, market news collector disabled");
        } else {
            sources.push((
                SourceContext::new("market"),
                Arc::new(MarketNewsSource::new(
                    state.config.market_news_api_key.clone(),
                )),
            ));
        }
    }
    if state.config.enable_rss_news {
        if state.config.rss_feeds.feeds.is_empty() {
            warn!("RSS collector enabled but feed list is empty, disabled");
        } else {
            sources.push((
                SourceContext::new("rss"),
                Arc::new(RssNewsSource::new(&state.config.rss_feeds.feeds)),
            ));
        }
    }

    let source_contexts: Vec<Arc<SourceContext>> =
        sources.iter().map(|(ctx, _)| ctx.clone()).collect();
    let mut save_worker_stats: Vec<(&'static str, Arc<SaveStats>)> = Vec::new();

    for (ctx, source) in &sources {
        // Scoring worker (one per source by default).
        if let Some(scorer) = &scorer {
            tokio::spawn(scoring::run_scoring_worker(
                state.clone(),
                ctx.clone(),
                scorer.clone(),
            ));
        }

        // Save worker, one per source, only with a live pool.
        if let Some(pool) = state.pool.clone() {
            let stats = Arc::new(SaveStats::default());
            save_worker_stats.push((ctx.name, stats.clone()));
            tokio::spawn(persistence::run_save_worker(
                state.clone(),
                ctx.clone(),
                pool,
                stats,
            ));
        }

        // Poll loop last, so its consumers already run.
        tokio::spawn(news::run_collector(
            state.clone(),
            ctx.clone(),
            source.clone(),
        ));
    }
    info!(count = sources.len(), "news collector fleet launched");

    // ── 6. Composer ──────────────────────────────────────────────────────
    let composer_handle = tokio::spawn(composer::run_composer(state.clone(), candle_rx));

    // ── 7. Aggregator loop ───────────────────────────────────────────────
    let aggregator_handle = tokio::spawn(market_data::run_second_loop(state.clone()));

    // ── 8. Status loop ───────────────────────────────────────────────────
    tokio::spawn(run_status_loop(state.clone(), source_contexts.clone()));

    // ── 9. Tick stream supervisor ────────────────────────────────────────
    tokio::spawn(market_data::run_stream_supervisor(state.clone()));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    state.shutdown();

    // Let the aggregator flush in-flight seconds, then let the composer
    // drain the candle channel.
    let _ = tokio::time::timeout(Duration::from_secs(2), aggregator_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), composer_handle).await;

    // Join detached tick-candle saves before the runtime goes away.
    state
        .drain_tick_candle_saves(Duration::from_secs(5))
        .await;

    // Save queues get up to 60 s to drain.
    let drain_deadline = Instant::now() + SAVE_DRAIN_TIMEOUT;
    while Instant::now() < drain_deadline
        && source_contexts.iter().any(|ctx| !ctx.to_save.is_empty())
    {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    // Grace period for a save already in flight when its queue emptied.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for ctx in &source_contexts {
        info!(source = ctx.name, summary = %ctx.summary(), "collector summary");
    }
    for (name, stats) in &save_worker_stats {
        info!(source = %name, summary = %stats.summary(), "save worker summary");
    }

    info!("Meridian Sentiment Engine shut down complete.");
    Ok(())
}

/// Select the scoring backend from configuration. Returns None when the
/// chosen provider has no credential.
fn build_scorer(config: &EngineConfig) -> Option<Arc<dyn SentimentScorer>> {
    match config.sentiment_provider {
        SentimentProviderKind::Fast => {
            if config.sentiment_api_key_fast.is_empty() {
                None
            } else {
                Some(Arc::new(FastProvider::new(
                    config.sentiment_api_key_fast.clone(),
                )))
            }
        }
        SentimentProviderKind::Accurate => {
            if config.sentiment_api_key_accurate.is_empty() {
                None
            } else {
                Some(Arc::new(AccurateProvider::new(
                    config.sentiment_api_key_accurate.clone(),
                )))
            }
        }
    }
}

/// Low-frequency pipeline self-observability: one status line a minute.
async fn run_status_loop(state: Arc<PipelineState>, sources: Vec<Arc<SourceContext>>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    // The first tick fires immediately; skip it so the first report carries
    // a minute of data.
    ticker.tick().await;

    while state.is_running() {
        ticker.tick().await;

        let queue_depths: Vec<String> = sources
            .iter()
            .map(|ctx| {
                format!(
                    "{}: score={} save={} dedup={}",
                    ctx.name,
                    ctx.to_score.len(),
                    ctx.to_save.len(),
                    ctx.dedup.len()
                )
            })
            .collect();

        info!(
            uptime_secs = state.start_time.elapsed().as_secs(),
            ticks = state.ticks_ingested.load(Ordering::Relaxed),
            second_candles = state.second_candles_emitted.load(Ordering::Relaxed),
            tick_candles = state.tick_candles_emitted.load(Ordering::Relaxed),
            snapshots = state.snapshots_written.load(Ordering::Relaxed),
            open_seconds = state.aggregator.open_seconds(),
            processed_seconds = state.aggregator.processed_len(),
            rolling_ticks = state.aggregator.rolling_len(),
            impacts_queued = state.scored_impacts.len(),
            impacts_dropped = state.scored_impacts.dropped_count(),
            queues = queue_depths.join(", "),
            "pipeline status"
        );
    }
}
