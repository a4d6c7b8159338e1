use crate::chart::types::{PriceTick, TradeTick, WINDOW_MS};
use crate::error::AppError;
use serde_json::{Map, Value};

const SYMBOL_ALIASES: [&str; 4] = ["symbol", "pair", "asset", "base"];
const PRICE_ALIASES: [&str; 3] = ["price", "value", "p"];
const TIMESTAMP_ALIASES: [&str; 3] = ["timestamp", "ts", "t"];
const TOKEN_ALIASES: [&str; 4] = ["asset", "asset_id", "token_id", "tokenId"];
const SIZE_ALIASES: [&str; 3] = ["size", "amount", "quantity"];
const NESTED_KEYS: [&str; 2] = ["data", "payload"];
const QUOTE_SUFFIXES: [&str; 2] = ["usdt", "usd"];
const SECONDS_THRESHOLD: f64 = 1e12;

/// One flattened object from an inbound frame, classified by what it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateShape<'a> {
    /// Carries a price directly.
    SingleUpdate {
        symbol: Option<String>,
        fields: &'a Map<String, Value>,
    },
    /// Carries an array of points under `data` or `payload.data`.
    BatchUpdate {
        symbol: Option<String>,
        items: &'a [Value],
    },
    /// Wrapper with nothing extractable at this level.
    Envelope,
}

/// Turns untyped feed frames into price ticks for one topic and target symbol.
#[derive(Debug, Clone)]
pub struct TickNormalizer {
    topic: String,
    target_symbol: String,
    single_update_per_frame: bool,
}

impl TickNormalizer {
    pub fn new(
        topic: impl Into<String>,
        target_symbol: impl Into<String>,
        single_update_per_frame: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            target_symbol: target_symbol.into(),
            single_update_per_frame,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn target_symbol(&self) -> &str {
        &self.target_symbol
    }

    /// Extracts, filters and sorts the ticks carried by `frame`. `now_ms` stands in
    /// for missing or unusable timestamps.
    pub fn normalize(&self, frame: &Value, now_ms: i64) -> Vec<PriceTick> {
        let mut ticks = Vec::new();
        if !envelope_topic_matches(frame, &self.topic) {
            return ticks;
        }

        for candidate in price_candidates(frame) {
            if !topic_matches(candidate, &self.topic) {
                continue;
            }

            match classify_candidate(candidate) {
                CandidateShape::SingleUpdate { symbol, fields } => {
                    if let Some(tick) = extract_point(fields, symbol, now_ms) {
                        ticks.push(tick);
                    }
                }
                CandidateShape::BatchUpdate { symbol, items } => {
                    for item in items {
                        let Some(fields) = item.as_object() else {
                            continue;
                        };
                        let item_symbol = extract_symbol(fields).or_else(|| symbol.clone());
                        if let Some(tick) = extract_point(fields, item_symbol, now_ms) {
                            ticks.push(tick);
                        }
                    }
                }
                CandidateShape::Envelope => {}
            }
        }

        ticks.retain(|tick| match tick.symbol.as_deref() {
            None => true,
            Some(symbol) => symbols_match(symbol, &self.target_symbol),
        });
        ticks.sort_by_key(|tick| tick.timestamp_ms);
        ticks.dedup_by(|next, previous| {
            next.timestamp_ms == previous.timestamp_ms && next.price == previous.price
        });

        if self.single_update_per_frame && ticks.len() > 1 {
            ticks.drain(..ticks.len() - 1);
        }

        ticks
    }
}

/// Decodes a raw text or binary frame into an untyped JSON value.
pub fn decode_frame(payload: &mut [u8]) -> Result<Value, AppError> {
    Ok(simd_json::serde::from_slice::<Value>(payload)?)
}

/// Extracts trade prints (token, price, size) from a frame on `topic`.
pub fn extract_trade_ticks(frame: &Value, topic: &str, now_ms: i64) -> Vec<TradeTick> {
    let mut trades = Vec::new();
    if !envelope_topic_matches(frame, topic) {
        return trades;
    }

    for candidate in flatten_frame(frame) {
        if !topic_matches(candidate, topic) {
            continue;
        }

        let Some(token_id) = first_string(candidate, &TOKEN_ALIASES) else {
            continue;
        };
        let Some(price) = first_number(candidate, &PRICE_ALIASES) else {
            continue;
        };
        let Some(size) = first_number(candidate, &SIZE_ALIASES) else {
            continue;
        };
        if !price.is_finite() || !size.is_finite() {
            continue;
        }

        trades.push(TradeTick {
            token_id,
            price,
            size,
            timestamp_ms: extract_timestamp(candidate, now_ms),
        });
    }

    trades.sort_by_key(|trade| trade.timestamp_ms);
    trades
}

/// Lists candidate objects in order: the frame itself (or its elements), then
/// `payload`, then `data`.
pub fn flatten_frame(frame: &Value) -> Vec<&Map<String, Value>> {
    let mut candidates = Vec::new();

    match frame {
        Value::Array(items) => {
            candidates.extend(items.iter().filter_map(Value::as_object));
        }
        Value::Object(fields) => {
            candidates.push(fields);
            for key in ["payload", "data"] {
                match fields.get(key) {
                    Some(Value::Array(items)) => {
                        candidates.extend(items.iter().filter_map(Value::as_object));
                    }
                    Some(Value::Object(nested)) => candidates.push(nested),
                    _ => {}
                }
            }
        }
        _ => {}
    }

    candidates
}

// A top-level batch is expanded once, through its own classification, so its
// items keep the envelope symbol.
fn price_candidates(frame: &Value) -> Vec<&Map<String, Value>> {
    match frame.as_object() {
        Some(fields) if batch_items(fields).is_some() => vec![fields],
        _ => flatten_frame(frame),
    }
}

pub fn classify_candidate(fields: &Map<String, Value>) -> CandidateShape<'_> {
    let symbol = extract_symbol(fields);

    if let Some(items) = batch_items(fields) {
        return CandidateShape::BatchUpdate { symbol, items };
    }

    if first_number(fields, &PRICE_ALIASES).is_some() {
        return CandidateShape::SingleUpdate { symbol, fields };
    }

    CandidateShape::Envelope
}

fn batch_items(fields: &Map<String, Value>) -> Option<&[Value]> {
    if let Some(Value::Array(items)) = fields.get("data") {
        return Some(items.as_slice());
    }
    match fields.get("payload").and_then(|payload| payload.get("data")) {
        Some(Value::Array(items)) => Some(items.as_slice()),
        _ => None,
    }
}

// Nested payloads inherit the topic of the envelope that carries them.
fn envelope_topic_matches(frame: &Value, topic: &str) -> bool {
    frame
        .as_object()
        .map_or(true, |fields| topic_matches(fields, topic))
}

fn topic_matches(fields: &Map<String, Value>, topic: &str) -> bool {
    match fields.get("topic").and_then(Value::as_str) {
        Some(candidate_topic) => candidate_topic.eq_ignore_ascii_case(topic),
        None => true,
    }
}

fn extract_symbol(fields: &Map<String, Value>) -> Option<String> {
    if let Some(symbol) = first_string(fields, &SYMBOL_ALIASES) {
        return Some(symbol);
    }

    NESTED_KEYS.iter().find_map(|key| {
        fields
            .get(*key)
            .and_then(Value::as_object)
            .and_then(|nested| first_string(nested, &SYMBOL_ALIASES))
    })
}

fn extract_point(
    fields: &Map<String, Value>,
    symbol: Option<String>,
    now_ms: i64,
) -> Option<PriceTick> {
    let price = first_number(fields, &PRICE_ALIASES)?;
    if !price.is_finite() || price <= 0.0 {
        return None;
    }

    Some(PriceTick {
        price,
        timestamp_ms: extract_timestamp(fields, now_ms),
        symbol,
    })
}

fn extract_timestamp(fields: &Map<String, Value>, now_ms: i64) -> i64 {
    first_number(fields, &TIMESTAMP_ALIASES)
        .map(|raw| normalize_timestamp_ms(raw, now_ms))
        .unwrap_or(now_ms)
}

/// Values below 1e12 are epoch seconds; anything else is already epoch millis.
/// Timestamps more than one window ahead of `now_ms` fall back to `now_ms`.
pub fn normalize_timestamp_ms(raw: f64, now_ms: i64) -> i64 {
    if !raw.is_finite() || raw <= 0.0 {
        return now_ms;
    }
    let millis = if raw < SECONDS_THRESHOLD {
        raw * 1_000.0
    } else {
        raw
    };
    let latest = now_ms.saturating_add(WINDOW_MS);
    if millis.round() > latest as f64 {
        return now_ms;
    }
    millis.round() as i64
}

fn first_string(fields: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| {
        fields
            .get(*alias)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn first_number(fields: &Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .find_map(|alias| fields.get(*alias).and_then(value_as_f64))
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Case-insensitive, punctuation-blind comparison that treats a trailing
/// `usd`/`usdt` quote as optional on both sides.
pub fn symbols_match(left: &str, right: &str) -> bool {
    let left = symbol_base(left);
    !left.is_empty() && left == symbol_base(right)
}

fn symbol_base(symbol: &str) -> String {
    let compact: String = symbol
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .collect();

    for suffix in QUOTE_SUFFIXES {
        if let Some(base) = compact.strip_suffix(suffix) {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    compact
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_100_000;

    fn normalizer(single_update_per_frame: bool) -> TickNormalizer {
        TickNormalizer::new("crypto_prices", "btcusdt", single_update_per_frame)
    }

    #[test]
    fn symbol_matching_tolerates_quote_suffix_and_punctuation() {
        assert!(symbols_match("BTC-USD", "btcusdt"));
        assert!(symbols_match("btc/usdt", "BTC"));
        assert!(symbols_match("Eth_Usd", "ETHUSD"));
        assert!(!symbols_match("BTC", "ETH"));
        assert!(!symbols_match("", "btc"));
    }

    #[test]
    fn normalizes_seconds_and_millis() {
        assert_eq!(normalize_timestamp_ms(1_700_000_000.0, NOW), 1_700_000_000_000);
        assert_eq!(normalize_timestamp_ms(1_700_000_000_123.0, NOW), 1_700_000_000_123);
        assert_eq!(normalize_timestamp_ms(-5.0, NOW), NOW);
        assert_eq!(normalize_timestamp_ms(f64::NAN, NOW), NOW);
    }

    #[test]
    fn far_future_timestamps_fall_back_to_now() {
        assert_eq!(normalize_timestamp_ms(1e19, NOW), NOW);
        assert_eq!(normalize_timestamp_ms((NOW + WINDOW_MS + 1) as f64, NOW), NOW);
        assert_eq!(
            normalize_timestamp_ms((NOW + 5_000) as f64, NOW),
            NOW + 5_000
        );

        let frame = json!({"payload": {"symbol": "btcusdt", "value": 10.0, "timestamp": 1e19}});
        let ticks = normalizer(false).normalize(&frame, NOW);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].timestamp_ms, NOW);
    }

    #[test]
    fn top_level_batch_for_another_symbol_is_dropped() {
        let frame = json!({
            "topic": "crypto_prices",
            "symbol": "ethusdt",
            "data": [{"value": 3200.0, "t": 1_700_000_000}]
        });
        assert!(normalizer(true).normalize(&frame, NOW).is_empty());
    }

    #[test]
    fn top_level_batch_items_are_emitted_once() {
        let frame = json!({
            "symbol": "btcusdt",
            "data": [
                {"value": 1.0, "t": 1_700_000_000},
                {"value": 2.0, "t": 1_700_000_000}
            ]
        });

        let ticks = normalizer(false).normalize(&frame, NOW);
        assert_eq!(ticks.len(), 2);
        assert!(ticks
            .iter()
            .all(|tick| tick.symbol.as_deref() == Some("btcusdt")));
    }

    #[test]
    fn extracts_single_update_nested_under_payload() {
        let frame = json!({
            "topic": "crypto_prices",
            "type": "update",
            "payload": {"symbol": "btcusdt", "value": 67_250.5, "timestamp": 1_700_000_000_000_i64}
        });

        let ticks = normalizer(false).normalize(&frame, NOW);
        assert_eq!(
            ticks,
            vec![PriceTick {
                price: 67_250.5,
                timestamp_ms: 1_700_000_000_000,
                symbol: Some("btcusdt".to_string()),
            }]
        );
    }

    #[test]
    fn expands_batched_points_and_sorts_them() {
        let frame = json!({
            "topic": "crypto_prices",
            "payload": {
                "symbol": "BTC-USD",
                "data": [
                    {"timestamp": 1_700_000_002, "value": "101.5"},
                    {"timestamp": 1_700_000_001, "value": 101.0},
                    {"timestamp": 1_700_000_003, "value": 0}
                ]
            }
        });

        let ticks = normalizer(false).normalize(&frame, NOW);
        let timestamps: Vec<i64> = ticks.iter().map(|tick| tick.timestamp_ms).collect();
        let prices: Vec<f64> = ticks.iter().map(|tick| tick.price).collect();

        assert_eq!(timestamps, vec![1_700_000_001_000, 1_700_000_002_000]);
        assert_eq!(prices, vec![101.0, 101.5]);
    }

    #[test]
    fn single_update_mode_keeps_only_latest_tick() {
        let frame = json!([
            {"symbol": "btcusdt", "p": 10.0, "t": 3},
            {"symbol": "btcusdt", "p": 12.0, "t": 5},
            {"symbol": "btcusdt", "p": 11.0, "t": 4}
        ]);

        let ticks = normalizer(true).normalize(&frame, NOW);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, 12.0);
        assert_eq!(ticks[0].timestamp_ms, 5_000);
    }

    #[test]
    fn drops_foreign_topics_and_symbols_but_keeps_unscoped() {
        let frame = json!([
            {"topic": "equity_prices", "symbol": "btcusdt", "price": 1.0, "ts": 1},
            {"symbol": "ethusdt", "price": 2.0, "ts": 2},
            {"price": 3.0, "ts": 3}
        ]);

        let ticks = normalizer(false).normalize(&frame, NOW);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, 3.0);
        assert_eq!(ticks[0].symbol, None);
    }

    #[test]
    fn nested_payload_of_foreign_envelope_is_ignored() {
        let frame = json!({
            "topic": "comments",
            "payload": {"symbol": "btcusdt", "value": 99.0, "timestamp": 1_700_000_000_000_i64}
        });
        assert!(normalizer(false).normalize(&frame, NOW).is_empty());
    }

    #[test]
    fn rejects_non_positive_and_non_numeric_prices() {
        let frame = json!([
            {"symbol": "btc", "price": -4.0},
            {"symbol": "btc", "price": "abc"},
            {"symbol": "btc", "price": "42.5"}
        ]);

        let ticks = normalizer(false).normalize(&frame, NOW);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, 42.5);
        assert_eq!(ticks[0].timestamp_ms, NOW);
    }

    #[test]
    fn normalization_is_deterministic() {
        let frame = json!({"data": [{"symbol": "btcusd", "value": 5.0, "t": 1_700_000_000}]});
        let first = normalizer(false).normalize(&frame, NOW);
        let second = normalizer(false).normalize(&frame, NOW);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn classifies_candidate_shapes() {
        let single = json!({"price": 1.0});
        let batch = json!({"payload": {"data": []}});
        let envelope = json!({"type": "subscribe"});

        assert!(matches!(
            classify_candidate(single.as_object().expect("object")),
            CandidateShape::SingleUpdate { .. }
        ));
        assert!(matches!(
            classify_candidate(batch.as_object().expect("object")),
            CandidateShape::BatchUpdate { .. }
        ));
        assert_eq!(
            classify_candidate(envelope.as_object().expect("object")),
            CandidateShape::Envelope
        );
    }

    #[test]
    fn decodes_text_frames_and_rejects_garbage() {
        let mut payload = br#"{"payload":{"symbol":"btcusdt","value":1.5}}"#.to_vec();
        let frame = decode_frame(&mut payload).expect("frame should decode");
        assert_eq!(normalizer(false).normalize(&frame, NOW).len(), 1);

        let mut broken = b"{not json".to_vec();
        assert!(decode_frame(&mut broken).is_err());
    }

    #[test]
    fn extracts_trade_ticks_with_string_numbers() {
        let frame = json!([{"price": "0.62", "size": "100", "asset": "YES_TOKEN"}]);

        let trades = extract_trade_ticks(&frame, "activity", NOW);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].token_id, "YES_TOKEN");
        assert_eq!(trades[0].timestamp_ms, NOW);
        assert!((trades[0].notional() - 62.0).abs() < 1e-9);
    }

    #[test]
    fn trade_extraction_skips_other_topics_and_missing_fields() {
        let frame = json!({
            "topic": "activity",
            "payload": {"asset_id": "NO_TOKEN", "price": 0.4, "size": 10, "timestamp": 1_700_000_000}
        });
        let trades = extract_trade_ticks(&frame, "activity", NOW);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].token_id, "NO_TOKEN");
        assert_eq!(trades[0].timestamp_ms, 1_700_000_000_000);

        let foreign = json!({"topic": "comments", "asset": "NO_TOKEN", "price": 0.4, "size": 1});
        assert!(extract_trade_ticks(&foreign, "activity", NOW).is_empty());

        let missing_size = json!([{"asset": "NO_TOKEN", "price": 0.4}]);
        assert!(extract_trade_ticks(&missing_size, "activity", NOW).is_empty());
    }
}
