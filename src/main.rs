use chart_feed_lib::chart::types::{ChartConnectionState, StartChartStreamArgs};
use chart_feed_lib::commands::chart_stream::{start_chart_stream, stop_chart_stream};
use chart_feed_lib::commands::health::health;
use chart_feed_lib::db::initialize_pool;
use chart_feed_lib::{AppError, AppState, ChartEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const CONFIG_PATH_ENV: &str = "CHART_FEED_CONFIG";

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

fn load_start_args() -> Result<Option<StartChartStreamArgs>, AppError> {
    let Some(path) = std::env::var_os(CONFIG_PATH_ENV) else {
        return Ok(None);
    };
    let raw = std::fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

fn log_event(event: &ChartEvent, last_state: &mut Option<ChartConnectionState>) {
    match event {
        ChartEvent::Status(status) => {
            if *last_state == Some(status.state) {
                debug!(state = ?status.state, last_price = ?status.last_price, "status heartbeat");
                return;
            }
            *last_state = Some(status.state);
            info!(
                state = ?status.state,
                symbol = %status.symbol,
                reconnect_attempts = status.reconnect_attempts,
                reason = ?status.reason,
                "chart status"
            );
        }
        ChartEvent::Frame(frame) => debug!(
            points = frame.points.len(),
            last_price = ?frame.last_price,
            axis_min = frame.axis.min,
            axis_max = frame.axis.max,
            "chart frame"
        ),
        ChartEvent::TradeFlow(update) => {
            let labels: Vec<&str> = update
                .annotations
                .iter()
                .map(|annotation| annotation.label.as_str())
                .collect();
            info!(?labels, "trade flow");
        }
        ChartEvent::HistoryBootstrap(bootstrap) => info!(
            condition_id = ?bootstrap.condition_id,
            points = bootstrap.history.points.len(),
            latest = ?bootstrap.history.latest,
            "outcome history"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();

    let args = load_start_args()?;
    let pool = initialize_pool().await?;
    let state = AppState::new(pool);
    let mut events = state.subscribe();

    let session = start_chart_stream(&state, args).await?;
    info!(
        topic = %session.topic,
        symbol = %session.symbol,
        trade_flow = session.trade_flow_enabled,
        mock = session.mock_mode,
        "chart feed running, press Ctrl-C to stop"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last_state = None;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(error) = result {
                    warn!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event, &mut last_state),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event log lagging"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stopped = stop_chart_stream(&state).await?;
    let report = health(&state).await?;
    info!(
        stopped = stopped.stopped,
        uptime_ms = report.uptime_ms as u64,
        cache_db = report.cache_db,
        "chart feed shut down"
    );
    Ok(())
}
