// =============================================================================
// Candle Aggregator — trades off the log, sealed candles and snapshots out
// =============================================================================

pub mod candle_state;
pub mod history;
pub mod message;
pub mod worker;

pub use worker::AggregatorWorker;
