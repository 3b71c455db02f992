// =============================================================================
// Storage — sealed candle history and the latest-indicators cache
// =============================================================================
//
// `CandleStore` is durable and keyed by (symbol, t_start_ms); writing the
// same candle twice leaves one row.  `LatestCache` holds one snapshot per
// symbol and is overwritten on every seal.
// =============================================================================

pub mod candle_store;
pub mod latest_cache;

pub use candle_store::{CandleStore, SqliteCandleStore};
pub use latest_cache::{LatestCache, MemoryLatestCache};
