pub mod backoff;
pub mod trade_stream;

pub use trade_stream::run_ingestor;
