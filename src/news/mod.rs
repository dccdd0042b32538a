// =============================================================================
// News Module
// =============================================================================
//
// Collector fleet for the sentiment pipeline:
// - Company news (per-ticker watchlist rotation)
// - Market news (single index-wide unit)
// - RSS (configured feed list)
//
// Each source owns a dedup cache and a pair of bounded queues; articles flow
// collector -> scoring worker -> (impact queue, save queue).

pub mod collector;
pub mod company;
pub mod dedup;
pub mod market;
pub mod rss;
pub mod sanitize;

pub use collector::{run_collector, NewsSource, SourceContext};
pub use company::CompanyNewsSource;
pub use market::MarketNewsSource;
pub use rss::RssNewsSource;
