// =============================================================================
// Candle state machine — one open candle per symbol
// =============================================================================
//
// absent → open   first trade of a bucket
// open   → open   trade in the same bucket (merged in place)
// open   → sealed trade in a strictly later bucket (returned to the caller,
//                 which persists it; a new candle opens from that trade)
//
// Rollover is lazy: a bucket is only sealed when its successor trade shows
// up.  Trades for an earlier bucket than the open one are rejected, and an
// entry id at or below the last applied one for the symbol is a redelivery.
// Entry ids only order within one stream, so the symbol must be the one the
// entry's stream belongs to.
// =============================================================================

use std::collections::HashMap;

use super::message::{LoggedTrade, MessageError};
use crate::stream::EntryId;
use crate::types::Candle;

/// Start of the bucket containing `ts_ms`.  Floors toward negative infinity.
pub fn floor_bucket(ts_ms: i64, bucket_ms: i64) -> i64 {
    ts_ms.div_euclid(bucket_ms) * bucket_ms
}

/// Outcome of applying one trade.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// First candle for the symbol.
    Started,
    /// Merged into the open candle.
    Updated,
    /// The previous candle was sealed and a new one opened.
    Rolled(Candle),
    /// Already applied; nothing changed.
    Duplicate,
}

/// Sole owner of the open candles.
#[derive(Debug)]
pub struct CandleAggregator {
    bucket_ms: i64,
    open: HashMap<String, Candle>,
    last_applied: HashMap<String, EntryId>,
}

impl CandleAggregator {
    pub fn new(bucket_ms: i64) -> Self {
        Self {
            bucket_ms,
            open: HashMap::new(),
            last_applied: HashMap::new(),
        }
    }

    pub fn open_candle(&self, symbol: &str) -> Option<&Candle> {
        self.open.get(symbol)
    }

    /// Apply the trade carried by entry `id`.
    pub fn apply(&mut self, id: EntryId, trade: &LoggedTrade) -> Result<Applied, MessageError> {
        let symbol = trade.symbol.as_str();
        if self.last_applied.get(symbol).is_some_and(|last| id <= *last) {
            return Ok(Applied::Duplicate);
        }

        let bucket_start = floor_bucket(trade.ts_ms, self.bucket_ms);
        let outcome = match self.open.get_mut(symbol) {
            Some(candle) if candle.t_start_ms == bucket_start => {
                candle.merge(trade.price, trade.quantity);
                Applied::Updated
            }
            Some(candle) if bucket_start < candle.t_start_ms => {
                return Err(MessageError::LateTrade {
                    bucket_start_ms: bucket_start,
                    open_start_ms: candle.t_start_ms,
                });
            }
            Some(candle) => {
                let fresh = Candle::open_at(symbol, bucket_start, self.bucket_ms, trade.price, trade.quantity);
                Applied::Rolled(std::mem::replace(candle, fresh))
            }
            None => {
                let fresh = Candle::open_at(symbol, bucket_start, self.bucket_ms, trade.price, trade.quantity);
                self.open.insert(symbol.to_string(), fresh);
                Applied::Started
            }
        };

        self.last_applied.insert(symbol.to_string(), id);
        Ok(outcome)
    }
}
