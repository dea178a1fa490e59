//! Parser module for Binance WebSocket and REST payloads
//!
//! Handles deserialization of depth updates, trades, candles, snapshots and
//! control responses, and converts them into [`crate::model`] types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{MarketDataError, Result};
use crate::model::{Candle, OrderBookDiff, OrderBookSnapshot, PriceLevel, Trade};

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event type
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Final update ID of the previous event (futures streams only)
    #[serde(rename = "pu", default)]
    pub previous_final_update_id: Option<u64>,

    /// Bids to update
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks to update
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

impl From<DepthUpdate> for OrderBookDiff {
    fn from(update: DepthUpdate) -> Self {
        OrderBookDiff {
            symbol: update.symbol,
            first_sequence_id: update.first_update_id,
            final_sequence_id: update.final_update_id,
            previous_final_sequence_id: update.previous_final_update_id,
            bid_changes: update.bids,
            ask_changes: update.asks,
            event_time: update.event_time,
        }
    }
}

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// Trade ID
    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    /// Trade time
    #[serde(rename = "T")]
    pub trade_time: u64,

    /// Is buyer maker
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl From<TradeEvent> for Trade {
    fn from(event: TradeEvent) -> Self {
        Trade {
            id: event.trade_id,
            symbol: event.symbol,
            price: event.price,
            quantity: event.quantity,
            event_time: event.trade_time,
            // The maker bought, so the taker sold.
            taker_is_buyer: !event.is_buyer_maker,
        }
    }
}

/// Binance kline message
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "k")]
    pub kline: Kline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Kline {
    #[serde(rename = "t")]
    pub open_time: u64,
    #[serde(rename = "T")]
    pub close_time: u64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o", deserialize_with = "deserialize_decimal")]
    pub open: Decimal,
    #[serde(rename = "h", deserialize_with = "deserialize_decimal")]
    pub high: Decimal,
    #[serde(rename = "l", deserialize_with = "deserialize_decimal")]
    pub low: Decimal,
    #[serde(rename = "c", deserialize_with = "deserialize_decimal")]
    pub close: Decimal,
    #[serde(rename = "v", deserialize_with = "deserialize_decimal")]
    pub volume: Decimal,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl From<KlineEvent> for Candle {
    fn from(event: KlineEvent) -> Self {
        let k = event.kline;
        Candle {
            symbol: event.symbol,
            interval: k.interval,
            open_time: k.open_time,
            close_time: k.close_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            is_closed: k.is_closed,
        }
    }
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    /// Last update ID
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

impl SnapshotResponse {
    /// Normalize into a snapshot: zero sizes dropped, duplicate prices
    /// collapsed (last wins), bids descending and asks ascending.
    pub fn into_snapshot(self, symbol: &str, captured_at: DateTime<Utc>) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: normalize_side(self.bids, true),
            asks: normalize_side(self.asks, false),
            sequence_id: self.last_update_id,
            captured_at,
        }
    }
}

fn normalize_side(levels: Vec<PriceLevel>, descending: bool) -> Vec<PriceLevel> {
    let mut merged = std::collections::BTreeMap::new();
    for level in levels.into_iter().filter(|l| l.size > Decimal::ZERO) {
        merged.insert(level.price, level.size);
    }
    let sorted = merged.into_iter().map(|(price, size)| PriceLevel { price, size });
    if descending {
        sorted.rev().collect()
    } else {
        sorted.collect()
    }
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Diff(OrderBookDiff),
    Trade(Trade),
    Candle(Candle),
    /// Subscription/command acknowledgement (`{"result": null, "id": n}`)
    Ack { id: u64 },
    /// Application-level keep-alive response (`{"pong": n}`)
    Pong { nonce: u64 },
    /// Well-formed payload of a type this engine does not consume
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message. Errors mean the payload is malformed.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;

        // Combined streams wrap the payload as {"stream": .., "data": ..}
        let payload = match value {
            Value::Object(mut map) if map.contains_key("stream") && map.contains_key("data") => {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };

        Self::parse_payload(payload)
    }

    fn parse_payload(payload: Value) -> Result<Self> {
        let Some(object) = payload.as_object() else {
            return Err(MarketDataError::ParseError(format!(
                "expected JSON object, got {}",
                payload
            )));
        };

        if let Some(event_type) = object.get("e").and_then(Value::as_str) {
            return match event_type {
                "depthUpdate" => {
                    let depth: DepthUpdate = serde_json::from_value(payload)?;
                    if depth.final_update_id < depth.first_update_id {
                        return Err(MarketDataError::ParseError(format!(
                            "depth update range inverted: U={} u={}",
                            depth.first_update_id, depth.final_update_id
                        )));
                    }
                    Ok(ParsedMessage::Diff(depth.into()))
                }
                "trade" => {
                    let trade: TradeEvent = serde_json::from_value(payload)?;
                    Ok(ParsedMessage::Trade(trade.into()))
                }
                "kline" => {
                    let kline: KlineEvent = serde_json::from_value(payload)?;
                    Ok(ParsedMessage::Candle(kline.into()))
                }
                _ => Ok(ParsedMessage::Unknown(payload.to_string())),
            };
        }

        if let Some(nonce) = object.get("pong").and_then(Value::as_u64) {
            return Ok(ParsedMessage::Pong { nonce });
        }

        if object.contains_key("result") {
            if let Some(id) = object.get("id").and_then(Value::as_u64) {
                return Ok(ParsedMessage::Ack { id });
            }
        }

        Ok(ParsedMessage::Unknown(payload.to_string()))
    }
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            let price = Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?;
            let size = Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?;
            if size.is_sign_negative() && !size.is_zero() {
                return Err(serde::de::Error::custom("Negative level size"));
            }
            Ok(PriceLevel { price, size })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "U": 100,
            "u": 105,
            "b": [["50000.00", "1.5"], ["49999.00", "0"]],
            "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::Diff(diff) = msg {
            assert_eq!(diff.symbol, "BTCUSDT");
            assert_eq!(diff.first_sequence_id, 100);
            assert_eq!(diff.final_sequence_id, 105);
            assert_eq!(diff.previous_final_sequence_id, None);
            assert_eq!(diff.bid_changes.len(), 2);
            assert!(diff.bid_changes[1].is_delete());
            assert_eq!(diff.ask_changes[0].price, dec!(50001.00));
        } else {
            panic!("Expected Diff");
        }
    }

    #[test]
    fn test_parse_futures_depth_with_previous_id() {
        let raw = r#"{"stream":"btcusdt@depth","data":{
            "e": "depthUpdate", "E": 1, "s": "BTCUSDT",
            "U": 200, "u": 210, "pu": 199,
            "b": [], "a": [["1.5", "3"]]
        }}"#;

        match ParsedMessage::parse(raw).unwrap() {
            ParsedMessage::Diff(diff) => {
                assert_eq!(diff.previous_final_sequence_id, Some(199));
                assert_eq!(diff.ask_changes, vec![PriceLevel::new(dec!(1.5), dec!(3))]);
            }
            other => panic!("Expected Diff, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "e": "trade",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "t": 12345,
            "p": "50000.50",
            "q": "0.5",
            "b": 111,
            "a": 222,
            "T": 1672531200001,
            "m": false
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::Trade(trade) = msg {
            assert_eq!(trade.symbol, "BTCUSDT");
            assert_eq!(trade.id, 12345);
            assert_eq!(trade.price, dec!(50000.50));
            assert_eq!(trade.event_time, 1672531200001);
            assert!(trade.taker_is_buyer);
        } else {
            panic!("Expected Trade");
        }
    }

    #[test]
    fn test_parse_kline() {
        let raw = r#"{"e":"kline","E":1,"s":"ETHUSDT","k":{
            "t":60000,"T":119999,"s":"ETHUSDT","i":"1m",
            "o":"10.0","c":"11.0","h":"12.0","l":"9.5","v":"100","x":true
        }}"#;

        match ParsedMessage::parse(raw).unwrap() {
            ParsedMessage::Candle(candle) => {
                assert_eq!(candle.interval, "1m");
                assert_eq!(candle.high, dec!(12.0));
                assert!(candle.is_closed);
            }
            other => panic!("Expected Candle, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_messages() {
        assert!(matches!(
            ParsedMessage::parse(r#"{"result":null,"id":7}"#).unwrap(),
            ParsedMessage::Ack { id: 7 }
        ));
        assert!(matches!(
            ParsedMessage::parse(r#"{"pong":42}"#).unwrap(),
            ParsedMessage::Pong { nonce: 42 }
        ));
        assert!(matches!(
            ParsedMessage::parse(r#"{"e":"24hrTicker","s":"BTCUSDT"}"#).unwrap(),
            ParsedMessage::Unknown(_)
        ));
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        assert!(ParsedMessage::parse("{not json").is_err());
        assert!(ParsedMessage::parse("[1,2,3]").is_err());
        // Truncated level pair
        let raw = r#"{"e":"depthUpdate","E":1,"s":"X","U":1,"u":2,"b":[["1"]],"a":[]}"#;
        assert!(ParsedMessage::parse(raw).is_err());
        // Inverted sequence range
        let raw = r#"{"e":"depthUpdate","E":1,"s":"X","U":5,"u":2,"b":[],"a":[]}"#;
        assert!(ParsedMessage::parse(raw).is_err());
    }

    #[test]
    fn test_snapshot_normalization() {
        let raw = r#"{
            "lastUpdateId": 1027024,
            "bids": [["4.0", "431.0"], ["4.2", "12.0"], ["4.1", "0"]],
            "asks": [["4.5", "12.0"], ["4.3", "1.0"]]
        }"#;
        let response: SnapshotResponse = serde_json::from_str(raw).unwrap();
        let snapshot = response.into_snapshot("BNBBTC", Utc::now());

        assert_eq!(snapshot.sequence_id, 1027024);
        let bid_prices: Vec<_> = snapshot.bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(4.2), dec!(4.0)]);
        let ask_prices: Vec<_> = snapshot.asks.iter().map(|l| l.price).collect();
        assert_eq!(ask_prices, vec![dec!(4.3), dec!(4.5)]);
    }
}
