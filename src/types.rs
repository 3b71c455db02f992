// =============================================================================
// Shared types used across the candlestream pipeline
// =============================================================================

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Flat string field map, the wire shape of every log entry.
pub type Fields = BTreeMap<String, String>;

/// Fractional digits used when rendering prices and quantities onto the log.
pub const PRICE_SCALE: u32 = 10;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Side
// =============================================================================

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Derive the aggressor side from the feed's "buyer is maker" flag.
    ///
    /// When the buyer is the resting maker the taker sold into the bid.
    pub fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker {
            Self::Sell
        } else {
            Self::Buy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown side {other:?}")),
        }
    }
}

// =============================================================================
// Trade
// =============================================================================

/// A normalized trade as published onto a symbol's log.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub symbol: String,
    pub ts_ms: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub source: String,
}

impl Trade {
    /// Render the trade into log entry fields.
    ///
    /// Price and quantity are always written with exactly [`PRICE_SCALE`]
    /// fractional digits.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("ts_ms".into(), self.ts_ms.to_string());
        fields.insert("symbol".into(), self.symbol.clone());
        fields.insert("price".into(), render_fixed(self.price));
        fields.insert("qty".into(), render_fixed(self.quantity));
        fields.insert("side".into(), self.side.to_string());
        fields.insert("src".into(), self.source.clone());
        fields
    }
}

/// Render a decimal with exactly [`PRICE_SCALE`] fractional digits.
pub fn render_fixed(value: Decimal) -> String {
    format!("{:.*}", PRICE_SCALE as usize, value.round_dp(PRICE_SCALE))
}

// =============================================================================
// Candle
// =============================================================================

/// An OHLCV candle for one symbol and one fixed-duration bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub t_start_ms: i64,
    pub t_end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Start a candle from the first trade observed in its bucket.
    pub fn open_at(
        symbol: impl Into<String>,
        t_start_ms: i64,
        bucket_ms: i64,
        price: f64,
        quantity: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            t_start_ms,
            t_end_ms: t_start_ms + bucket_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
        }
    }

    /// Merge a same-bucket trade into the candle.
    pub fn merge(&mut self, price: f64, quantity: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += quantity;
    }
}

// =============================================================================
// Indicator snapshot
// =============================================================================

/// Latest indicator values for one symbol, computed on every seal.
///
/// Every value is optional; undefined values are omitted from the cache
/// entry rather than written as placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_start_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_hist: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb_mid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb_upper: Option<f64>,
}

impl IndicatorSnapshot {
    fn numeric_fields(&self) -> [(&'static str, Option<f64>); 10] {
        [
            ("close", self.close),
            ("sma", self.sma),
            ("ema", self.ema),
            ("rsi", self.rsi),
            ("macd", self.macd),
            ("macd_signal", self.macd_signal),
            ("macd_hist", self.macd_hist),
            ("bb_lower", self.bb_lower),
            ("bb_mid", self.bb_mid),
            ("bb_upper", self.bb_upper),
        ]
    }

    /// Flatten into the string field map stored under `latest:<symbol>`.
    /// Only defined, finite values are written.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("symbol".into(), self.symbol.clone());
        if let Some(t) = self.t_start_ms {
            fields.insert("t_start_ms".into(), t.to_string());
        }
        for (name, value) in self.numeric_fields() {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                fields.insert(name.into(), v.to_string());
            }
        }
        fields
    }

    /// Rebuild a snapshot from a flat field map. Unparseable values are
    /// treated as absent.
    pub fn from_fields(symbol: &str, fields: &Fields) -> Self {
        let num = |name: &str| fields.get(name).and_then(|s| s.parse::<f64>().ok());
        Self {
            symbol: fields
                .get("symbol")
                .cloned()
                .unwrap_or_else(|| symbol.to_string()),
            t_start_ms: fields.get("t_start_ms").and_then(|s| s.parse().ok()),
            close: num("close"),
            sma: num("sma"),
            ema: num("ema"),
            rsi: num("rsi"),
            macd: num("macd"),
            macd_signal: num("macd_signal"),
            macd_hist: num("macd_hist"),
            bb_lower: num("bb_lower"),
            bb_mid: num("bb_mid"),
            bb_upper: num("bb_upper"),
        }
    }
}

// =============================================================================
// Dead-letter record
// =============================================================================

/// Audit record for a message the aggregator could not apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub stream: String,
    pub id: String,
    pub err: String,
    pub fields: String,
}

impl DeadLetterRecord {
    pub fn new(stream: &str, id: impl ToString, err: impl ToString, payload: &Fields) -> Self {
        Self {
            stream: stream.to_string(),
            id: id.to_string(),
            err: err.to_string(),
            fields: serde_json::to_string(payload).unwrap_or_else(|_| format!("{payload:?}")),
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("stream".into(), self.stream.clone());
        fields.insert("id".into(), self.id.clone());
        fields.insert("err".into(), self.err.clone());
        fields.insert("fields".into(), self.fields.clone());
        fields
    }
}
