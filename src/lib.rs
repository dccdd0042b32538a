// =============================================================================
// Meridian Sentiment Engine — library root
// =============================================================================
//
// Real-time market-sentiment pipeline for a single leveraged equity index
// ETF. The binary in main.rs wires these modules together; external
// collaborators (the minute analyzer, admin tooling) consume the persistence
// adapter and scoring contracts from here.
// =============================================================================

pub mod app_state;
pub mod composer;
pub mod market_data;
pub mod market_hours;
pub mod news;
pub mod persistence;
pub mod queues;
pub mod runtime_config;
pub mod scoring;
pub mod types;
