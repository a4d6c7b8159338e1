use crate::chart::pipeline::run_chart_stream;
use crate::chart::types::{
    ChartConnectionState, ChartStatusSnapshot, ChartStreamSession, ChartStreamStopResult,
    StartChartStreamArgs,
};
use crate::error::AppError;
use crate::state::{AppState, ChartStreamHandle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartVisibilityResult {
    pub visible: bool,
    pub changed: bool,
}

async fn take_running_stream(state: &AppState) -> bool {
    let existing_handle = {
        let mut stream_slot = state.chart_stream.lock().await;
        stream_slot.take()
    };

    let Some(handle) = existing_handle else {
        return false;
    };
    handle.cancellation_token.cancel();
    if let Err(error) = handle.join_handle.await {
        warn!(%error, "chart stream task did not shut down cleanly");
    }
    true
}

/// Starts a chart pipeline, replacing any instance that is already running.
pub async fn start_chart_stream(
    state: &AppState,
    args: Option<StartChartStreamArgs>,
) -> Result<ChartStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    if take_running_stream(state).await {
        debug!("replaced running chart stream");
    }

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let runtime = state.chart_runtime();
    let runtime_config = config.clone();

    let join_handle = tokio::spawn(async move {
        run_chart_stream(runtime_config, runtime, task_token).await;
    });

    {
        let mut stream_slot = state.chart_stream.lock().await;
        *stream_slot = Some(ChartStreamHandle {
            cancellation_token,
            join_handle,
        });
    }

    info!(topic = %config.topic, symbol = %config.symbol, "chart stream started");
    Ok(ChartStreamSession::from_config(&config))
}

pub async fn stop_chart_stream(state: &AppState) -> Result<ChartStreamStopResult, AppError> {
    let stopped = take_running_stream(state).await;

    {
        let mut writable = state.chart_status.write().await;
        writable.state = ChartConnectionState::Stopped;
        writable.reason = Some("stream stopped by command".to_string());
    }

    Ok(ChartStreamStopResult { stopped })
}

pub async fn chart_stream_status(state: &AppState) -> Result<ChartStatusSnapshot, AppError> {
    let snapshot = state.chart_status.read().await.clone();
    Ok(snapshot)
}

/// Mirrors page visibility into the running pipeline.
pub async fn set_chart_visibility(
    state: &AppState,
    visible: bool,
) -> Result<ChartVisibilityResult, AppError> {
    let previous = state.visibility.send_replace(visible);
    if previous != visible {
        debug!(visible, "chart visibility changed");
    }

    Ok(ChartVisibilityResult {
        visible,
        changed: previous != visible,
    })
}
