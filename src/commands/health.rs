use crate::{error::AppError, state::AppState};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub cache_db: &'static str,
    pub chart_stream_running: bool,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    chart_stream_running: bool,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        cache_db: db_status,
        chart_stream_running,
    }
}

pub async fn health(state: &AppState) -> Result<HealthResponse, AppError> {
    let chart_stream_running = state.chart_stream.lock().await.is_some();
    Ok(build_health_response(state.started_at, &state.db_pool, chart_stream_running).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok_status_and_cache_health() {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");

        let response = build_health_response(Instant::now(), &pool, false).await;

        assert_eq!(response.status, "ok");
        assert_eq!(response.cache_db, "ok");
        assert!(!response.chart_stream_running);
        assert!(response.uptime_ms <= 1_000);
    }

    #[tokio::test]
    async fn health_reports_closed_pool_as_error() {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should initialize");
        pool.close().await;

        let response = build_health_response(Instant::now(), &pool, true).await;
        assert_eq!(response.cache_db, "error");
        assert!(response.chart_stream_running);
    }
}
