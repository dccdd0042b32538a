pub mod aggregator;
pub mod tick_stream;

// Re-export the aggregator for convenient access (e.g. `use crate::market_data::TickAggregator`).
pub use aggregator::{run_second_loop, TickAggregator};
pub use tick_stream::run_stream_supervisor;
