// =============================================================================
// Persistence Module
// =============================================================================
//
// The dual-table adapter (minute rows + per-second snapshots), the
// hash-keyed article store, the 100-tick candle store, and the per-source
// save workers that feed the article table.

pub mod articles;
pub mod database;
pub mod save_worker;
pub mod snapshots;

pub use articles::save_article_with_retry;
pub use database::{connect, ensure_schema};
pub use save_worker::{run_save_worker, SaveJob, SaveStats};
pub use snapshots::{
    insert_minute_row, insert_second_snapshot_with_retry, insert_tick_candle_with_retry,
    latest_minute_row, latest_second_snapshot,
};
