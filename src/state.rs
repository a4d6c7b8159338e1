use crate::chart::clock::{Clock, SystemClock};
use crate::chart::persistence::{PriceCache, SqliteStore};
use crate::chart::pipeline::ChartRuntime;
use crate::chart::types::{ChartStatusSnapshot, DEFAULT_SYMBOL, DEFAULT_TOPIC};
use crate::chart::ChartEvent;
use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHART_EVENT_CAPACITY: usize = 1_024;

pub struct ChartStreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub http_client: Client,
    pub price_cache: PriceCache,
    pub clock: Arc<dyn Clock>,
    pub chart_stream: Mutex<Option<ChartStreamHandle>>,
    pub chart_status: Arc<RwLock<ChartStatusSnapshot>>,
    pub events: broadcast::Sender<ChartEvent>,
    pub visibility: watch::Sender<bool>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self::with_clock(db_pool, Arc::new(SystemClock))
    }

    pub fn with_clock(db_pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        let chart_status = ChartStatusSnapshot::idle(
            DEFAULT_TOPIC.to_string(),
            DEFAULT_SYMBOL.to_string(),
            Some("stream idle".to_string()),
        );
        let (events, _) = broadcast::channel(CHART_EVENT_CAPACITY);
        let (visibility, _) = watch::channel(true);

        Self {
            started_at: Instant::now(),
            price_cache: PriceCache::new(Arc::new(SqliteStore::new(db_pool.clone()))),
            db_pool,
            http_client: Client::new(),
            clock,
            chart_stream: Mutex::new(None),
            chart_status: Arc::new(RwLock::new(chart_status)),
            events,
            visibility,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChartEvent> {
        self.events.subscribe()
    }

    pub fn chart_runtime(&self) -> ChartRuntime {
        ChartRuntime {
            cache: self.price_cache.clone(),
            clock: Arc::clone(&self.clock),
            http_client: self.http_client.clone(),
            status_store: Arc::clone(&self.chart_status),
            events: self.events.clone(),
            visibility: self.visibility.subscribe(),
        }
    }
}
