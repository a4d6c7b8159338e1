use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const WINDOW_MS: i64 = 40_000;
pub const MAX_POINTS: usize = 4_000;
pub const TRADE_FLOW_TTL_MS: i64 = 8_000;
pub const TRADE_FLOW_MAX_ITEMS: usize = 6;
pub const TRADE_FLOW_SWEEP_MS: u64 = 500;
pub const PRICE_CACHE_PREFIX: &str = "chart-feed:last-price";

pub const DEFAULT_STREAM_URL: &str = "wss://ws-live-data.polymarket.com";
pub const DEFAULT_REST_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_HISTORY_BASE_URL: &str = "https://clob.polymarket.com";
pub const DEFAULT_TOPIC: &str = "crypto_prices";
pub const DEFAULT_EVENT_TYPE: &str = "update";
pub const DEFAULT_SYMBOL: &str = "btcusdt";
pub const DEFAULT_TRADE_TOPIC: &str = "activity";
pub const DEFAULT_TRADE_EVENT_TYPE: &str = "trades";
pub const DEFAULT_SINGLE_UPDATE_PER_FRAME: bool = true;
pub const DEFAULT_RENDER_INTERVAL_MS: u64 = 33;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_500;
pub const DEFAULT_HISTORY_INTERVAL: &str = "1d";
pub const DEFAULT_HISTORY_FIDELITY: u32 = 5;
pub const DEFAULT_MOCK_MODE: bool = false;
pub const MIN_RENDER_INTERVAL_MS: u64 = 16;
pub const MAX_RENDER_INTERVAL_MS: u64 = 1_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;
pub const MIN_HISTORY_FIDELITY: u32 = 1;
pub const MAX_HISTORY_FIDELITY: u32 = 1_440;

const HISTORY_INTERVALS: [&str; 6] = ["1h", "6h", "1d", "1w", "1m", "max"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChartConnectionState {
    Idle,
    Connecting,
    Live,
    Offline,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub price: f64,
    pub timestamp_ms: i64,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
    pub ticks: Vec<f64>,
}

/// Stored cache entry. The field names are the persisted JSON shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PersistedPrice {
    pub price: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Yes,
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeFlowAnnotation {
    pub id: String,
    pub label: String,
    pub outcome: TradeOutcome,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub token_id: String,
    pub price: f64,
    pub size: f64,
    pub timestamp_ms: i64,
}

impl TradeTick {
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }
}

/// Token identifiers of the two outcomes whose trades feed the annotation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedOutcomes {
    pub yes_token_id: String,
    pub no_token_id: String,
}

impl WatchedOutcomes {
    pub fn outcome_for(&self, token_id: &str) -> Option<TradeOutcome> {
        if token_id == self.yes_token_id {
            Some(TradeOutcome::Yes)
        } else if token_id == self.no_token_id {
            Some(TradeOutcome::No)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CombinedHistoryPoint {
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yes_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_value: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CombinedHistory {
    pub points: Vec<CombinedHistoryPoint>,
    pub latest: BTreeMap<TradeOutcome, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartStatusSnapshot {
    pub state: ChartConnectionState,
    pub topic: String,
    pub symbol: String,
    pub last_tick_ms: Option<i64>,
    pub last_price: Option<f64>,
    pub reconnect_attempts: u32,
    pub reason: Option<String>,
}

impl ChartStatusSnapshot {
    pub fn idle(topic: String, symbol: String, reason: Option<String>) -> Self {
        Self {
            state: ChartConnectionState::Idle,
            topic,
            symbol,
            last_tick_ms: None,
            last_price: None,
            reconnect_attempts: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartFrameUpdate {
    pub now_ms: i64,
    pub points: Vec<WindowPoint>,
    pub axis: AxisRange,
    pub last_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeFlowUpdate {
    pub annotations: Vec<TradeFlowAnnotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBootstrap {
    pub condition_id: Option<String>,
    pub history: CombinedHistory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartChartStreamArgs {
    pub stream_url: Option<String>,
    pub rest_base_url: Option<String>,
    pub history_base_url: Option<String>,
    pub topic: Option<String>,
    pub event_type: Option<String>,
    pub symbol: Option<String>,
    pub trade_stream_url: Option<String>,
    pub trade_topic: Option<String>,
    pub trade_event_type: Option<String>,
    pub yes_token_id: Option<String>,
    pub no_token_id: Option<String>,
    pub condition_id: Option<String>,
    pub single_update_per_frame: Option<bool>,
    pub render_interval_ms: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    pub history_interval: Option<String>,
    pub history_fidelity: Option<u32>,
    pub mock_mode: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ChartStreamConfig {
    pub stream_url: String,
    pub rest_base_url: String,
    pub history_base_url: String,
    pub topic: String,
    pub event_type: String,
    pub symbol: String,
    pub trade_stream_url: String,
    pub trade_topic: String,
    pub trade_event_type: String,
    pub watched: Option<WatchedOutcomes>,
    pub condition_id: Option<String>,
    pub single_update_per_frame: bool,
    pub render_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub history_interval: String,
    pub history_fidelity: u32,
    pub mock_mode: bool,
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn validate_url(field: &str, value: &str, schemes: &[&str]) -> Result<(), AppError> {
    if schemes
        .iter()
        .any(|scheme| value.starts_with(&format!("{scheme}://")))
    {
        return Ok(());
    }
    Err(AppError::InvalidArgument(format!(
        "{field} must start with one of {}",
        schemes.join("/")
    )))
}

impl StartChartStreamArgs {
    pub fn normalize(self) -> Result<ChartStreamConfig, AppError> {
        let stream_url = non_empty_or(self.stream_url, DEFAULT_STREAM_URL);
        validate_url("streamUrl", &stream_url, &["ws", "wss"])?;
        let trade_stream_url = non_empty_or(self.trade_stream_url, &stream_url);
        validate_url("tradeStreamUrl", &trade_stream_url, &["ws", "wss"])?;
        let rest_base_url = non_empty_or(self.rest_base_url, DEFAULT_REST_BASE_URL);
        validate_url("restBaseUrl", &rest_base_url, &["http", "https"])?;
        let history_base_url = non_empty_or(self.history_base_url, DEFAULT_HISTORY_BASE_URL);
        validate_url("historyBaseUrl", &history_base_url, &["http", "https"])?;

        let topic = non_empty_or(self.topic, DEFAULT_TOPIC);
        let event_type = non_empty_or(self.event_type, DEFAULT_EVENT_TYPE);
        let symbol = non_empty_or(self.symbol, DEFAULT_SYMBOL);
        if !symbol.chars().any(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(
                "symbol must contain at least one alphanumeric character".to_string(),
            ));
        }

        let trade_topic = non_empty_or(self.trade_topic, DEFAULT_TRADE_TOPIC);
        let trade_event_type = non_empty_or(self.trade_event_type, DEFAULT_TRADE_EVENT_TYPE);
        let watched = match (
            optional_trimmed(self.yes_token_id),
            optional_trimmed(self.no_token_id),
        ) {
            (Some(yes_token_id), Some(no_token_id)) => Some(WatchedOutcomes {
                yes_token_id,
                no_token_id,
            }),
            (None, None) => None,
            _ => {
                return Err(AppError::InvalidArgument(
                    "yesTokenId and noTokenId must be provided together".to_string(),
                ))
            }
        };

        let render_interval_ms = self
            .render_interval_ms
            .unwrap_or(DEFAULT_RENDER_INTERVAL_MS);
        if !(MIN_RENDER_INTERVAL_MS..=MAX_RENDER_INTERVAL_MS).contains(&render_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "renderIntervalMs must be between {MIN_RENDER_INTERVAL_MS} and {MAX_RENDER_INTERVAL_MS}"
            )));
        }

        let reconnect_delay_ms = self
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        let history_interval = non_empty_or(self.history_interval, DEFAULT_HISTORY_INTERVAL);
        if !HISTORY_INTERVALS.contains(&history_interval.as_str()) {
            return Err(AppError::InvalidArgument(format!(
                "historyInterval must be one of {}",
                HISTORY_INTERVALS.join(", ")
            )));
        }

        let history_fidelity = self.history_fidelity.unwrap_or(DEFAULT_HISTORY_FIDELITY);
        if !(MIN_HISTORY_FIDELITY..=MAX_HISTORY_FIDELITY).contains(&history_fidelity) {
            return Err(AppError::InvalidArgument(format!(
                "historyFidelity must be between {MIN_HISTORY_FIDELITY} and {MAX_HISTORY_FIDELITY}"
            )));
        }

        Ok(ChartStreamConfig {
            stream_url,
            rest_base_url,
            history_base_url,
            topic,
            event_type,
            symbol,
            trade_stream_url,
            trade_topic,
            trade_event_type,
            watched,
            condition_id: optional_trimmed(self.condition_id),
            single_update_per_frame: self
                .single_update_per_frame
                .unwrap_or(DEFAULT_SINGLE_UPDATE_PER_FRAME),
            render_interval_ms,
            reconnect_delay_ms,
            history_interval,
            history_fidelity,
            mock_mode: self.mock_mode.unwrap_or(DEFAULT_MOCK_MODE),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamSession {
    pub running: bool,
    pub topic: String,
    pub event_type: String,
    pub symbol: String,
    pub trade_flow_enabled: bool,
    pub single_update_per_frame: bool,
    pub render_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub mock_mode: bool,
}

impl ChartStreamSession {
    pub fn from_config(config: &ChartStreamConfig) -> Self {
        Self {
            running: true,
            topic: config.topic.clone(),
            event_type: config.event_type.clone(),
            symbol: config.symbol.clone(),
            trade_flow_enabled: config.watched.is_some(),
            single_update_per_frame: config.single_update_per_frame,
            render_interval_ms: config.render_interval_ms,
            reconnect_delay_ms: config.reconnect_delay_ms,
            mock_mode: config.mock_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamStopResult {
    pub stopped: bool,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct ReferencePriceWire {
    pub opening_price: Option<f64>,
    pub closing_price: Option<f64>,
    pub latest_price: Option<f64>,
    pub latest_window_end_ms: Option<i64>,
    pub latest_source_timestamp_ms: Option<i64>,
    pub interval_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferencePrice {
    pub price: f64,
    pub timestamp_ms: i64,
}

impl ReferencePriceWire {
    /// Picks the freshest usable price: latest, then closing, then opening.
    pub fn into_reference(self, fallback_timestamp_ms: i64) -> Result<ReferencePrice, AppError> {
        let price = [self.latest_price, self.closing_price, self.opening_price]
            .into_iter()
            .flatten()
            .find(|price| price.is_finite() && *price > 0.0)
            .ok_or_else(|| {
                AppError::InvalidArgument("reference snapshot has no usable price".to_string())
            })?;

        let timestamp_ms = self
            .latest_source_timestamp_ms
            .or(self.latest_window_end_ms)
            .filter(|timestamp| *timestamp > 0)
            .unwrap_or(fallback_timestamp_ms);

        Ok(ReferencePrice {
            price,
            timestamp_ms,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PriceHistoryWire {
    #[serde(default)]
    pub history: Vec<PriceHistoryPointWire>,
}

#[derive(Debug, Deserialize)]
pub struct PriceHistoryPointWire {
    pub t: i64,
    pub p: f64,
}

impl From<PriceHistoryWire> for Vec<HistoryPoint> {
    fn from(value: PriceHistoryWire) -> Self {
        value
            .history
            .into_iter()
            .map(|point| HistoryPoint {
                timestamp_ms: point.t.saturating_mul(1_000),
                value: point.p,
            })
            .collect()
    }
}
