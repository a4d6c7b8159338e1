pub mod axis;
pub mod clock;
pub mod history;
pub mod normalizer;
pub mod persistence;
pub mod pipeline;
pub mod rest;
pub mod stream;
pub mod trade_flow;
pub mod types;
pub mod window;

use serde::Serialize;
use types::{ChartFrameUpdate, ChartStatusSnapshot, HistoryBootstrap, TradeFlowUpdate};

pub const CHART_STATUS_EVENT: &str = "chart_status";
pub const CHART_FRAME_EVENT: &str = "chart_frame";
pub const TRADE_FLOW_EVENT: &str = "trade_flow";
pub const HISTORY_BOOTSTRAP_EVENT: &str = "history_bootstrap";

/// Everything a pipeline instance pushes to the renderer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ChartEvent {
    #[serde(rename = "chart_status")]
    Status(ChartStatusSnapshot),
    #[serde(rename = "chart_frame")]
    Frame(ChartFrameUpdate),
    #[serde(rename = "trade_flow")]
    TradeFlow(TradeFlowUpdate),
    #[serde(rename = "history_bootstrap")]
    HistoryBootstrap(HistoryBootstrap),
}

impl ChartEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => CHART_STATUS_EVENT,
            Self::Frame(_) => CHART_FRAME_EVENT,
            Self::TradeFlow(_) => TRADE_FLOW_EVENT,
            Self::HistoryBootstrap(_) => HISTORY_BOOTSTRAP_EVENT,
        }
    }
}
