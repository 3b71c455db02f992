// =============================================================================
// Trade Ingestor — exchange aggTrade feed onto the durable log
// =============================================================================
//
// One task per symbol.  Each task holds a WebSocket connection to the
// exchange's aggregated-trade stream, normalizes every text frame into a
// `Trade` and appends it to `<stream_prefix><symbol>` with approximate
// length trimming.
//
// Failure policy:
//   - Malformed frame      → warn and skip, connection kept.
//   - Disconnect / read or publish error → reconnect after a capped
//     exponential backoff with jitter; a successful connect resets it.
//   - No inbound traffic for a ping interval plus the ping timeout → the
//     connection is treated as dead and goes through the same backoff.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::app_state::PipelineStats;
use crate::config::AppConfig;
use crate::market_data::backoff::Backoff;
use crate::stream::StreamLog;
use crate::types::{now_ms, Side, Trade};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field} {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Wire shape of a Binance aggTrade frame; only the fields used here.
///
/// ```json
/// { "e": "aggTrade", "E": 1700000000123, "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "m": true }
/// ```
#[derive(Debug, Deserialize)]
struct AggTradeFrame {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "m", default)]
    buyer_is_maker: bool,
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
}

fn parse_decimal(field: &'static str, raw: &str) -> Result<Decimal, FeedError> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| FeedError::InvalidNumber {
            field,
            value: raw.to_string(),
        })
}

/// Normalize one aggTrade text frame for `symbol`.
///
/// The event time falls back to `now_ms` when it is absent or zero.
pub fn normalize_agg_trade(text: &str, symbol: &str, source: &str, now_ms: i64) -> Result<Trade, FeedError> {
    let frame: AggTradeFrame = serde_json::from_str(text)?;

    Ok(Trade {
        symbol: symbol.to_string(),
        ts_ms: frame.event_time.filter(|&t| t != 0).unwrap_or(now_ms),
        price: parse_decimal("price", &frame.price)?,
        quantity: parse_decimal("quantity", &frame.quantity)?,
        side: Side::from_buyer_is_maker(frame.buyer_is_maker),
        source: source.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the aggTrade stream for `symbol` and publish trades until the
/// stream disconnects or an error occurs, then return so that
/// [`run_ingestor`] can back off and reconnect.
pub async fn run_trade_stream(
    cfg: &AppConfig,
    log: &dyn StreamLog,
    stats: &PipelineStats,
    symbol: &str,
    backoff: &mut Backoff,
) -> Result<()> {
    let url = cfg.feed_url_for(symbol);
    let stream = cfg.stream_key(symbol);
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    backoff.reset();
    let (mut write, mut read) = ws_stream.split();

    // Any inbound frame, pongs included, proves the connection is alive.
    let idle = cfg.feed_idle_timeout();
    let mut deadline = Instant::now() + idle;
    let mut ping = tokio::time::interval(cfg.feed_ping_interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout_at(deadline, read.next()) => next,
            _ = ping.tick() => {
                write
                    .send(Message::Ping(Vec::new()))
                    .await
                    .context("failed to ping trade WebSocket")?;
                continue;
            }
        };
        let Ok(next) = next else {
            warn!(symbol = %symbol, idle_ms = idle.as_millis() as u64, "trade WebSocket silent; dropping connection");
            bail!("no traffic from trade WebSocket for {}ms", idle.as_millis());
        };
        deadline = Instant::now() + idle;

        match next {
            Some(Ok(Message::Text(text))) => {
                match normalize_agg_trade(&text, symbol, &cfg.feed_source, now_ms()) {
                    Ok(trade) => {
                        let id = log
                            .append(&stream, &trade.to_fields(), Some(cfg.stream_maxlen))
                            .await
                            .with_context(|| format!("failed to publish trade to {stream}"))?;
                        PipelineStats::bump(&stats.trades_published);
                        debug!(symbol = %symbol, id = %id, price = %trade.price, side = %trade.side, "trade published");
                    }
                    Err(e) => {
                        PipelineStats::bump(&stats.frames_skipped);
                        warn!(symbol = %symbol, error = %e, "skipping malformed aggTrade frame");
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(symbol = %symbol, frame = ?frame, "trade WebSocket closed by server");
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Keep one symbol's feed connected forever.
pub async fn run_ingestor(
    cfg: Arc<AppConfig>,
    log: Arc<dyn StreamLog>,
    stats: Arc<PipelineStats>,
    symbol: String,
) {
    let mut backoff = Backoff::from_config(&cfg);
    let component = format!("ingest:{symbol}");

    loop {
        if let Err(e) = run_trade_stream(&cfg, log.as_ref(), &stats, &symbol, &mut backoff).await {
            stats.record_error(&component, format!("{e:#}"));
            error!(symbol = %symbol, error = %format!("{e:#}"), "trade stream error");
        }

        PipelineStats::bump(&stats.feed_reconnects);
        let delay = backoff.next_delay();
        warn!(symbol = %symbol, delay_ms = delay.as_millis() as u64, "reconnecting trade stream");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stream::MemoryLog;

    const FRAME: &str = r#"{"e":"aggTrade","E":1700000000123,"s":"BTCUSDT","a":1,"p":"37000.10","q":"0.500","f":1,"l":2,"T":1700000000120,"m":true,"M":true}"#;

    #[test]
    fn normalizes_binance_frame() {
        let trade = normalize_agg_trade(FRAME, "btcusdt", "binance", 42).unwrap();
        assert_eq!(trade.symbol, "btcusdt");
        assert_eq!(trade.ts_ms, 1_700_000_000_123);
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.source, "binance");

        let fields = trade.to_fields();
        assert_eq!(fields["price"], "37000.1000000000");
        assert_eq!(fields["qty"], "0.5000000000");
        assert_eq!(fields["side"], "sell");
    }

    #[test]
    fn event_time_falls_back_to_clock() {
        let missing = r#"{"p":"1.0","q":"2.0","m":false}"#;
        let trade = normalize_agg_trade(missing, "ethusdt", "binance", 42).unwrap();
        assert_eq!(trade.ts_ms, 42);
        assert_eq!(trade.side, Side::Buy);

        let zero = r#"{"p":"1.0","q":"2.0","m":false,"E":0}"#;
        assert_eq!(normalize_agg_trade(zero, "ethusdt", "binance", 7).unwrap().ts_ms, 7);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            normalize_agg_trade("not json", "btcusdt", "binance", 0),
            Err(FeedError::Json(_))
        ));
        assert!(matches!(
            normalize_agg_trade(r#"{"result":null,"id":1}"#, "btcusdt", "binance", 0),
            Err(FeedError::Json(_))
        ));
        assert!(matches!(
            normalize_agg_trade(r#"{"p":"abc","q":"1"}"#, "btcusdt", "binance", 0),
            Err(FeedError::InvalidNumber { field: "price", .. })
        ));
    }

    #[test]
    fn missing_maker_flag_means_buy() {
        let trade = normalize_agg_trade(r#"{"p":"5","q":"1","E":1}"#, "btcusdt", "binance", 0).unwrap();
        assert_eq!(trade.side, Side::Buy);
    }

    #[tokio::test]
    async fn silent_feed_is_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Sends one trade, then holds the socket open without reading or
        // answering pings.
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(FRAME.to_string())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let cfg = AppConfig {
            feed_url: format!("ws://{addr}/{{symbol}}"),
            feed_ping_interval_ms: 20,
            feed_ping_timeout_ms: 30,
            ..AppConfig::default()
        };
        let log = MemoryLog::new();
        let stats = PipelineStats::default();
        let mut backoff = Backoff::from_config(&cfg);

        let out = tokio::time::timeout(
            Duration::from_secs(5),
            run_trade_stream(&cfg, &log, &stats, "btcusdt", &mut backoff),
        )
        .await
        .expect("stream should give up on a silent feed");

        let err = out.unwrap_err();
        assert!(format!("{err:#}").contains("no traffic"), "{err:#}");
        assert_eq!(log.len("trades:btcusdt").await.unwrap(), 1);
        assert_eq!(stats.snapshot().trades_published, 1);
        server.abort();
    }
}
