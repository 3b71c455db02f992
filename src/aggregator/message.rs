// =============================================================================
// Logged trade parsing — validation of entries read back from the log
// =============================================================================

use thiserror::Error;

use crate::types::{Fields, Side};

/// Why an entry could not be applied.  Every variant is routed to the
/// dead-letter stream and the entry is acknowledged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessageError {
    #[error("missing field {0:?}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("late trade: bucket {bucket_start_ms} precedes open candle {open_start_ms}")]
    LateTrade { bucket_start_ms: i64, open_start_ms: i64 },

    #[error("symbol {found:?} does not match stream symbol {expected:?}")]
    SymbolMismatch { expected: String, found: String },
}

/// A trade as the aggregator consumes it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedTrade {
    pub symbol: String,
    pub ts_ms: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Option<Side>,
}

fn required<'a>(fields: &'a Fields, name: &'static str) -> Result<&'a str, MessageError> {
    fields
        .get(name)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or(MessageError::MissingField(name))
}

fn invalid(field: &'static str, value: &str) -> MessageError {
    MessageError::InvalidField {
        field,
        value: value.to_string(),
    }
}

/// Parse and validate a log entry read from `stream_symbol`'s stream.
///
/// The stream decides the symbol; a payload naming another one is
/// rejected.  Price must be finite and positive, quantity finite and
/// non-negative.  `side` and `src` are informational; an unknown side is
/// not an error.
pub fn parse_logged_trade(fields: &Fields, stream_symbol: &str) -> Result<LoggedTrade, MessageError> {
    let symbol = required(fields, "symbol")?;
    if !symbol.eq_ignore_ascii_case(stream_symbol) {
        return Err(MessageError::SymbolMismatch {
            expected: stream_symbol.to_string(),
            found: symbol.to_string(),
        });
    }

    let raw_ts = required(fields, "ts_ms")?;
    let ts_ms: i64 = raw_ts.parse().map_err(|_| invalid("ts_ms", raw_ts))?;

    let raw_price = required(fields, "price")?;
    let price: f64 = raw_price
        .parse()
        .ok()
        .filter(|p: &f64| p.is_finite() && *p > 0.0)
        .ok_or_else(|| invalid("price", raw_price))?;

    let raw_qty = required(fields, "qty")?;
    let quantity: f64 = raw_qty
        .parse()
        .ok()
        .filter(|q: &f64| q.is_finite() && *q >= 0.0)
        .ok_or_else(|| invalid("qty", raw_qty))?;

    Ok(LoggedTrade {
        symbol: stream_symbol.to_string(),
        ts_ms,
        price,
        quantity,
        side: fields.get("side").and_then(|s| s.parse().ok()),
    })
}
