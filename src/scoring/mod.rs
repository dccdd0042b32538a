// =============================================================================
// Scoring Module
// =============================================================================
//
// Article scoring pipeline:
// - SentimentScorer capability with fast (batch) and accurate (per-article)
//   providers, selected once at startup
// - Impact math shared with the minute analyzer's averaging contract
// - Per-source worker that applies impacts before saves

pub mod impact;
pub mod provider;
pub mod worker;

pub use impact::{compute_impact, mean_new_article_contribution};
pub use provider::{AccurateProvider, FastProvider, ScoreRequest, SentimentScorer};
pub use worker::run_scoring_worker;
