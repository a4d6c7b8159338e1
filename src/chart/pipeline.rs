use crate::chart::axis::compute_axis;
use crate::chart::clock::Clock;
use crate::chart::normalizer::{extract_trade_ticks, TickNormalizer};
use crate::chart::persistence::PriceCache;
use crate::chart::rest::{fetch_reference_price, load_combined_history};
use crate::chart::stream::{
    run_stream_connection, ConnectionPhase, StreamConnectionConfig, StreamEvent,
    StreamSubscription,
};
use crate::chart::trade_flow::TradeFlowFeed;
use crate::chart::types::{
    ChartConnectionState, ChartFrameUpdate, ChartStatusSnapshot, ChartStreamConfig,
    HistoryBootstrap, PersistedPrice, PriceTick, ReferencePrice, TradeFlowUpdate,
    TRADE_FLOW_SWEEP_MS,
};
use crate::chart::window::WindowBuffer;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::ChartEvent;

const STATUS_HEARTBEAT_MS: u64 = 1_000;
const STATUS_OFFLINE_THROTTLE_MS: u64 = 500;
const STREAM_CHANNEL_CAPACITY: usize = 256;
const MOCK_FRAME_INTERVAL_MS: u64 = 250;
const MOCK_BASE_PRICE: f64 = 67_250.0;
const MOCK_TRADE_EVERY: u64 = 8;

/// Chart state owned by one running pipeline.
#[derive(Debug)]
pub struct ChartPipeline {
    normalizer: TickNormalizer,
    trade_topic: String,
    window: WindowBuffer,
    trade_flow: TradeFlowFeed,
    live_tick_seen: bool,
    last_tick_ms: Option<i64>,
}

impl ChartPipeline {
    pub fn new(config: &ChartStreamConfig) -> Self {
        Self {
            normalizer: TickNormalizer::new(
                config.topic.clone(),
                config.symbol.clone(),
                config.single_update_per_frame,
            ),
            trade_topic: config.trade_topic.clone(),
            window: WindowBuffer::default(),
            trade_flow: TradeFlowFeed::new(config.watched.clone()),
            live_tick_seen: false,
            last_tick_ms: None,
        }
    }

    pub fn seed_from_cache(&mut self, cached: &PersistedPrice, now_ms: i64) -> bool {
        self.window.seed(cached.price, cached.timestamp, now_ms)
    }

    /// Applies the REST reference price unless a live tick already landed.
    pub fn apply_reference(&mut self, reference: ReferencePrice, now_ms: i64) -> bool {
        if self.live_tick_seen || !reference.price.is_finite() || reference.price <= 0.0 {
            return false;
        }
        let tick = PriceTick {
            price: reference.price,
            timestamp_ms: reference.timestamp_ms,
            symbol: None,
        };
        self.window.append(&tick, now_ms);
        true
    }

    /// Normalizes and appends one price frame. Returns the accepted ticks.
    pub fn ingest_price_frame(&mut self, frame: &Value, now_ms: i64) -> Vec<PriceTick> {
        let ticks = self.normalizer.normalize(frame, now_ms);
        for tick in &ticks {
            self.window.append(tick, now_ms);
        }
        if let Some(last) = ticks.last() {
            self.live_tick_seen = true;
            self.last_tick_ms = Some(last.timestamp_ms);
        }
        ticks
    }

    pub fn ingest_trade_frame(&mut self, frame: &Value, now_ms: i64) -> Option<TradeFlowUpdate> {
        let mut changed = false;
        for trade in extract_trade_ticks(frame, &self.trade_topic, now_ms) {
            changed |= self.trade_flow.ingest(&trade, now_ms).is_some();
        }
        changed.then(|| self.trade_flow_update())
    }

    pub fn sweep_trade_flow(&mut self, now_ms: i64) -> Option<TradeFlowUpdate> {
        self.trade_flow
            .sweep(now_ms)
            .then(|| self.trade_flow_update())
    }

    pub fn trade_flow_update(&self) -> TradeFlowUpdate {
        TradeFlowUpdate {
            annotations: self.trade_flow.annotations(),
        }
    }

    /// Advances the window to `now_ms` and snapshots what the chart should draw.
    pub fn render_frame(&mut self, now_ms: i64) -> ChartFrameUpdate {
        self.window.tick(now_ms);
        ChartFrameUpdate {
            now_ms,
            axis: compute_axis(&self.window.values()),
            points: self.window.points(),
            last_price: self.window.last_value(),
        }
    }

    pub fn has_live_tick(&self) -> bool {
        self.live_tick_seen
    }

    pub fn last_tick_ms(&self) -> Option<i64> {
        self.last_tick_ms
    }

    pub fn last_price(&self) -> Option<f64> {
        self.window.last_value()
    }
}

/// Collaborators a pipeline instance runs against.
#[derive(Clone)]
pub struct ChartRuntime {
    pub cache: PriceCache,
    pub clock: Arc<dyn Clock>,
    pub http_client: Client,
    pub status_store: Arc<RwLock<ChartStatusSnapshot>>,
    pub events: broadcast::Sender<ChartEvent>,
    pub visibility: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<ChartConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

#[derive(Clone)]
struct StatusPublisher {
    status_store: Arc<RwLock<ChartStatusSnapshot>>,
    events: broadcast::Sender<ChartEvent>,
    throttle: Arc<Mutex<StatusPublishThrottle>>,
    pipeline: Arc<Mutex<ChartPipeline>>,
    topic: String,
    symbol: String,
}

impl StatusPublisher {
    async fn publish(
        &self,
        state: ChartConnectionState,
        reconnect_attempts: u32,
        reason: Option<String>,
    ) {
        let (last_tick_ms, last_price) = {
            let readable = self.pipeline.lock();
            (readable.last_tick_ms(), readable.last_price())
        };
        let snapshot = ChartStatusSnapshot {
            state,
            topic: self.topic.clone(),
            symbol: self.symbol.clone(),
            last_tick_ms,
            last_price,
            reconnect_attempts,
            reason,
        };

        {
            let mut writable = self.status_store.write().await;
            *writable = snapshot.clone();
        }

        emit_event(&self.events, ChartEvent::Status(snapshot));
    }

    async fn publish_throttled(
        &self,
        state: ChartConnectionState,
        reconnect_attempts: u32,
        reason: Option<String>,
    ) {
        if !allow_status_publish(&self.throttle, state, &reason, Instant::now()) {
            return;
        }
        self.publish(state, reconnect_attempts, reason).await;
    }

    async fn heartbeat(&self) {
        let current = self.status_store.read().await.clone();
        self.publish(current.state, current.reconnect_attempts, current.reason)
            .await;
    }
}

fn allow_status_publish(
    throttle: &Mutex<StatusPublishThrottle>,
    state: ChartConnectionState,
    reason: &Option<String>,
    now: Instant,
) -> bool {
    let mut writable = throttle.lock();
    let should_throttle = state == ChartConnectionState::Offline;

    if should_throttle
        && writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_OFFLINE_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

fn emit_event(events: &broadcast::Sender<ChartEvent>, event: ChartEvent) {
    let name = event.name();
    if events.send(event).is_err() {
        trace!(event = name, "no chart event subscribers");
    }
}

/// Runs one chart pipeline until `cancel_token` fires, then tears every
/// child task down and publishes `stopped`.
pub async fn run_chart_stream(
    config: ChartStreamConfig,
    runtime: ChartRuntime,
    cancel_token: CancellationToken,
) {
    let pipeline = Arc::new(Mutex::new(ChartPipeline::new(&config)));
    let publisher = StatusPublisher {
        status_store: Arc::clone(&runtime.status_store),
        events: runtime.events.clone(),
        throttle: Arc::new(Mutex::new(StatusPublishThrottle::default())),
        pipeline: Arc::clone(&pipeline),
        topic: config.topic.clone(),
        symbol: config.symbol.clone(),
    };

    info!(
        topic = %config.topic,
        symbol = %config.symbol,
        mock = config.mock_mode,
        trade_flow = config.watched.is_some(),
        "starting chart stream"
    );
    publisher
        .publish(
            ChartConnectionState::Idle,
            0,
            Some("starting chart stream".to_string()),
        )
        .await;

    if let Some(cached) = runtime.cache.read(&config.topic, &config.symbol).await {
        let seeded = pipeline
            .lock()
            .seed_from_cache(&cached, runtime.clock.now_ms());
        if seeded {
            debug!(price = cached.price, "chart seeded from cached price");
        }
    }

    // A new market context starts with an empty trade-flow list.
    let initial_flow = pipeline.lock().trade_flow_update();
    emit_event(&runtime.events, ChartEvent::TradeFlow(initial_flow));

    let (price_tx, price_rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
    let (trade_tx, trade_rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    if config.mock_mode {
        let mock_trade_tx = config.watched.as_ref().map(|_| trade_tx.clone());
        handles.push(tokio::spawn(run_mock_producer(
            config.clone(),
            price_tx,
            mock_trade_tx,
            cancel_token.child_token(),
        )));
    } else {
        handles.push(tokio::spawn(run_stream_connection(
            StreamConnectionConfig {
                url: config.stream_url.clone(),
                subscription: StreamSubscription {
                    topic: config.topic.clone(),
                    event_type: config.event_type.clone(),
                    symbol: Some(config.symbol.clone()),
                },
                reconnect_delay_ms: config.reconnect_delay_ms,
            },
            runtime.visibility.clone(),
            price_tx,
            cancel_token.child_token(),
        )));

        if config.watched.is_some() {
            handles.push(tokio::spawn(run_stream_connection(
                StreamConnectionConfig {
                    url: config.trade_stream_url.clone(),
                    subscription: StreamSubscription {
                        topic: config.trade_topic.clone(),
                        event_type: config.trade_event_type.clone(),
                        symbol: None,
                    },
                    reconnect_delay_ms: config.reconnect_delay_ms,
                },
                runtime.visibility.clone(),
                trade_tx.clone(),
                cancel_token.child_token(),
            )));
        }

        handles.push(tokio::spawn(run_reference_fetch(
            config.clone(),
            runtime.clone(),
            Arc::clone(&pipeline),
            cancel_token.child_token(),
        )));

        if config.watched.is_some() {
            handles.push(tokio::spawn(run_history_bootstrap(
                config.clone(),
                runtime.clone(),
                cancel_token.child_token(),
            )));
        }
    }
    drop(trade_tx);

    handles.push(tokio::spawn(run_price_consumer(
        config.clone(),
        runtime.clone(),
        Arc::clone(&pipeline),
        publisher.clone(),
        price_rx,
        cancel_token.child_token(),
    )));

    if config.watched.is_some() {
        handles.push(tokio::spawn(run_trade_consumer(
            runtime.clone(),
            Arc::clone(&pipeline),
            trade_rx,
            cancel_token.child_token(),
        )));
        handles.push(tokio::spawn(run_trade_flow_sweeper(
            runtime.clone(),
            Arc::clone(&pipeline),
            cancel_token.child_token(),
        )));
    }

    handles.push(tokio::spawn(run_render_clock(
        config.render_interval_ms,
        runtime.clone(),
        Arc::clone(&pipeline),
        cancel_token.child_token(),
    )));

    let heartbeat_publisher = publisher.clone();
    let heartbeat_cancel = cancel_token.child_token();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => heartbeat_publisher.heartbeat().await,
            }
        }
    }));

    cancel_token.cancelled().await;
    for handle in handles {
        if let Err(error) = handle.await {
            warn!(%error, "chart stream task ended abnormally");
        }
    }

    let reconnect_attempts = runtime.status_store.read().await.reconnect_attempts;
    publisher
        .publish(
            ChartConnectionState::Stopped,
            reconnect_attempts,
            Some("chart stream stopped".to_string()),
        )
        .await;
    info!(topic = %config.topic, symbol = %config.symbol, "chart stream stopped");
}

async fn run_price_consumer(
    config: ChartStreamConfig,
    runtime: ChartRuntime,
    pipeline: Arc<Mutex<ChartPipeline>>,
    publisher: StatusPublisher,
    mut price_rx: mpsc::Receiver<StreamEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = price_rx.recv() => next,
        };
        let Some(event) = next else {
            break;
        };

        match event {
            StreamEvent::Frame(frame) => {
                let now_ms = runtime.clock.now_ms();
                let (accepted, first_live) = {
                    let mut writable = pipeline.lock();
                    let had_live = writable.has_live_tick();
                    let accepted = writable.ingest_price_frame(&frame, now_ms);
                    let first_live = !had_live && writable.has_live_tick();
                    (accepted, first_live)
                };
                if accepted.is_empty() {
                    trace!("frame carried no ticks for this chart");
                    continue;
                }
                if first_live {
                    info!(price = accepted[accepted.len() - 1].price, "first live tick");
                }
                for tick in &accepted {
                    runtime
                        .cache
                        .write(&config.topic, &config.symbol, tick.price, tick.timestamp_ms)
                        .await;
                }
            }
            StreamEvent::Phase {
                phase,
                reconnect_attempts,
                reason,
            } => {
                // Teardown is published once by the pipeline itself.
                if phase == ConnectionPhase::TornDown {
                    continue;
                }
                let state = ChartConnectionState::from(phase);
                debug!(?state, reconnect_attempts, "price stream phase changed");
                publisher
                    .publish_throttled(state, reconnect_attempts, reason)
                    .await;
            }
        }
    }
}

async fn run_trade_consumer(
    runtime: ChartRuntime,
    pipeline: Arc<Mutex<ChartPipeline>>,
    mut trade_rx: mpsc::Receiver<StreamEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = trade_rx.recv() => next,
        };
        let Some(event) = next else {
            break;
        };

        match event {
            StreamEvent::Frame(frame) => {
                let now_ms = runtime.clock.now_ms();
                let update = pipeline.lock().ingest_trade_frame(&frame, now_ms);
                if let Some(update) = update {
                    emit_event(&runtime.events, ChartEvent::TradeFlow(update));
                }
            }
            StreamEvent::Phase {
                phase,
                reconnect_attempts,
                ..
            } => debug!(?phase, reconnect_attempts, "trade stream phase changed"),
        }
    }
}

async fn run_trade_flow_sweeper(
    runtime: ChartRuntime,
    pipeline: Arc<Mutex<ChartPipeline>>,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(TRADE_FLOW_SWEEP_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let now_ms = runtime.clock.now_ms();
                let update = pipeline.lock().sweep_trade_flow(now_ms);
                if let Some(update) = update {
                    emit_event(&runtime.events, ChartEvent::TradeFlow(update));
                }
            }
        }
    }
}

async fn run_render_clock(
    render_interval_ms: u64,
    runtime: ChartRuntime,
    pipeline: Arc<Mutex<ChartPipeline>>,
    cancel_token: CancellationToken,
) {
    let mut visibility = runtime.visibility.clone();
    let mut visible = *visibility.borrow_and_update();
    let mut visibility_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(render_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let emit_frame = |pipeline: &Mutex<ChartPipeline>| {
        let frame = pipeline.lock().render_frame(runtime.clock.now_ms());
        emit_event(&runtime.events, ChartEvent::Frame(frame));
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = visibility.changed(), if visibility_open => match changed {
                Ok(()) => {
                    let now_visible = *visibility.borrow_and_update();
                    if now_visible && !visible {
                        // Jump straight to "now" instead of replaying the hidden gap.
                        emit_frame(&pipeline);
                        ticker.reset();
                    }
                    visible = now_visible;
                }
                Err(_) => visibility_open = false,
            },
            _ = ticker.tick(), if visible => emit_frame(&pipeline),
        }
    }
}

async fn run_reference_fetch(
    config: ChartStreamConfig,
    runtime: ChartRuntime,
    pipeline: Arc<Mutex<ChartPipeline>>,
    cancel_token: CancellationToken,
) {
    let requested_at_ms = runtime.clock.now_ms();
    let result = tokio::select! {
        _ = cancel_token.cancelled() => return,
        result = fetch_reference_price(
            &runtime.http_client,
            &config.rest_base_url,
            &config.symbol,
            requested_at_ms,
        ) => result,
    };

    let reference = match result {
        Ok(reference) => reference,
        Err(error) => {
            debug!(%error, "reference price unavailable");
            return;
        }
    };

    let applied = pipeline
        .lock()
        .apply_reference(reference, runtime.clock.now_ms());
    if !applied {
        debug!("live tick arrived before reference price");
        return;
    }

    debug!(price = reference.price, "chart seeded from reference price");
    runtime
        .cache
        .write(
            &config.topic,
            &config.symbol,
            reference.price,
            reference.timestamp_ms,
        )
        .await;
}

async fn run_history_bootstrap(
    config: ChartStreamConfig,
    runtime: ChartRuntime,
    cancel_token: CancellationToken,
) {
    let Some(watched) = config.watched.as_ref() else {
        return;
    };

    let result = tokio::select! {
        _ = cancel_token.cancelled() => return,
        result = load_combined_history(
            &runtime.http_client,
            &config.history_base_url,
            watched,
            &config.history_interval,
            config.history_fidelity,
        ) => result,
    };

    match result {
        Ok(history) => {
            info!(points = history.points.len(), "outcome history loaded");
            emit_event(
                &runtime.events,
                ChartEvent::HistoryBootstrap(HistoryBootstrap {
                    condition_id: config.condition_id.clone(),
                    history,
                }),
            );
        }
        Err(error) => warn!(%error, "outcome history unavailable"),
    }
}

fn mock_price(step: u64) -> f64 {
    // Triangle wave, 40 steps per period.
    let phase = (step % 40) as f64;
    let offset = if phase < 20.0 { phase } else { 40.0 - phase };
    MOCK_BASE_PRICE + (offset - 10.0) * 1.5
}

pub fn build_mock_price_frame(config: &ChartStreamConfig, step: u64, now_ms: i64) -> Value {
    json!({
        "topic": config.topic,
        "type": config.event_type,
        "timestamp": now_ms,
        "payload": {
            "symbol": config.symbol,
            "timestamp": now_ms,
            "value": mock_price(step),
        }
    })
}

pub fn build_mock_trade_frame(config: &ChartStreamConfig, step: u64, now_ms: i64) -> Option<Value> {
    let watched = config.watched.as_ref()?;
    let round = step / MOCK_TRADE_EVERY;
    let (token_id, price) = if round % 2 == 0 {
        (&watched.yes_token_id, 0.62)
    } else {
        (&watched.no_token_id, 0.38)
    };

    Some(json!({
        "topic": config.trade_topic,
        "type": config.trade_event_type,
        "timestamp": now_ms,
        "payload": {
            "asset": token_id,
            "price": price,
            "size": 50 + (round % 7) * 25,
            "timestamp": now_ms,
        }
    }))
}

async fn run_mock_producer(
    config: ChartStreamConfig,
    price_tx: mpsc::Sender<StreamEvent>,
    trade_tx: Option<mpsc::Sender<StreamEvent>>,
    cancel_token: CancellationToken,
) {
    let live = StreamEvent::Phase {
        phase: ConnectionPhase::Live,
        reconnect_attempts: 0,
        reason: Some("mock feed".to_string()),
    };
    if price_tx.send(live).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(MOCK_FRAME_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut step: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let now_ms = crate::chart::clock::now_unix_ms();
                let frame = build_mock_price_frame(&config, step, now_ms);
                if price_tx.send(StreamEvent::Frame(frame)).await.is_err() {
                    break;
                }

                if step % MOCK_TRADE_EVERY == 0 {
                    if let (Some(sender), Some(frame)) =
                        (trade_tx.as_ref(), build_mock_trade_frame(&config, step, now_ms))
                    {
                        if sender.send(StreamEvent::Frame(frame)).await.is_err() {
                            trace!("mock trade consumer closed");
                            break;
                        }
                    }
                }
                step = step.wrapping_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::clock::{ManualClock, SystemClock};
    use crate::chart::persistence::{KeyValueStore, MemoryStore};
    use crate::chart::types::{StartChartStreamArgs, TradeOutcome};

    fn config(args: StartChartStreamArgs) -> ChartStreamConfig {
        args.normalize().expect("args should normalize")
    }

    fn watched_config() -> ChartStreamConfig {
        config(StartChartStreamArgs {
            yes_token_id: Some("YES_TOKEN".to_string()),
            no_token_id: Some("NO_TOKEN".to_string()),
            ..Default::default()
        })
    }

    const T0: i64 = 1_700_000_000_000;

    fn live_frame(price: f64, timestamp_ms: i64) -> Value {
        json!({
            "topic": "crypto_prices",
            "payload": {"symbol": "btcusdt", "value": price, "timestamp": timestamp_ms}
        })
    }

    #[test]
    fn cache_seed_is_replaced_by_live_ticks() {
        let mut pipeline = ChartPipeline::new(&config(StartChartStreamArgs::default()));
        let cached = PersistedPrice {
            price: 67_000.0,
            timestamp: T0 - 60_000,
        };
        assert!(pipeline.seed_from_cache(&cached, T0));
        assert!(!pipeline.has_live_tick());
        assert_eq!(pipeline.last_price(), Some(67_000.0));

        let accepted = pipeline.ingest_price_frame(&live_frame(67_100.0, T0 + 500), T0 + 600);
        assert_eq!(accepted.len(), 1);
        assert!(pipeline.has_live_tick());
        assert_eq!(pipeline.last_tick_ms(), Some(T0 + 500));
        assert_eq!(pipeline.last_price(), Some(67_100.0));
        assert!(!pipeline.seed_from_cache(&cached, T0 + 1_000));
    }

    #[test]
    fn reference_price_only_applies_before_live_data() {
        let mut pipeline = ChartPipeline::new(&config(StartChartStreamArgs::default()));
        let reference = ReferencePrice {
            price: 66_900.0,
            timestamp_ms: T0 - 1_000,
        };
        assert!(pipeline.apply_reference(reference, T0));
        assert_eq!(pipeline.last_price(), Some(66_900.0));

        pipeline.ingest_price_frame(&live_frame(67_000.0, T0 + 100), T0 + 100);
        assert!(!pipeline.apply_reference(reference, T0 + 200));
        assert_eq!(pipeline.last_price(), Some(67_000.0));
    }

    #[test]
    fn foreign_symbol_frames_are_not_accepted() {
        let mut pipeline = ChartPipeline::new(&config(StartChartStreamArgs::default()));
        let frame = json!({
            "topic": "crypto_prices",
            "payload": {"symbol": "ethusdt", "value": 3_200.0, "timestamp": T0}
        });
        assert!(pipeline.ingest_price_frame(&frame, T0).is_empty());
        assert!(!pipeline.has_live_tick());
        assert_eq!(pipeline.last_price(), None);
    }

    #[test]
    fn render_frame_extends_window_and_contains_values() {
        let mut pipeline = ChartPipeline::new(&config(StartChartStreamArgs::default()));
        pipeline.ingest_price_frame(&live_frame(100.0, T0 + 1_000), T0 + 1_000);
        pipeline.ingest_price_frame(&live_frame(101.5, T0 + 1_500), T0 + 1_500);

        let frame = pipeline.render_frame(T0 + 2_000);
        assert_eq!(frame.now_ms, T0 + 2_000);
        assert_eq!(frame.last_price, Some(101.5));
        assert_eq!(frame.points.len(), 3);
        assert_eq!(
            frame.points.last().map(|point| point.timestamp_ms),
            Some(T0 + 2_000)
        );
        for pair in frame.points.windows(2) {
            assert!(pair[0].timestamp_ms < pair[1].timestamp_ms);
        }
        for point in &frame.points {
            assert!(point.value >= frame.axis.min && point.value <= frame.axis.max);
        }
    }

    #[test]
    fn empty_pipeline_renders_fallback_frame() {
        let mut pipeline = ChartPipeline::new(&config(StartChartStreamArgs::default()));
        let frame = pipeline.render_frame(1_000);
        assert!(frame.points.is_empty());
        assert_eq!(frame.last_price, None);
        assert_eq!(frame.axis, crate::chart::axis::fallback_axis());
    }

    #[test]
    fn trade_frames_feed_annotations_that_sweep_out() {
        let config = watched_config();
        let mut pipeline = ChartPipeline::new(&config);
        let frame = build_mock_trade_frame(&config, 0, 1_000).expect("watched config");

        let update = pipeline
            .ingest_trade_frame(&frame, 1_000)
            .expect("trade should annotate");
        assert_eq!(update.annotations.len(), 1);
        assert_eq!(update.annotations[0].outcome, TradeOutcome::Yes);
        assert_eq!(update.annotations[0].label, "+$31");

        assert!(pipeline.sweep_trade_flow(9_000).is_none());
        let swept = pipeline
            .sweep_trade_flow(9_500)
            .expect("expired annotation should be removed");
        assert!(swept.annotations.is_empty());
    }

    #[test]
    fn mock_frames_normalize_to_one_tick_each() {
        let config = config(StartChartStreamArgs::default());
        let mut pipeline = ChartPipeline::new(&config);
        for step in 0..50 {
            let now_ms = 1_700_000_000_000 + step as i64 * 250;
            let frame = build_mock_price_frame(&config, step, now_ms);
            let accepted = pipeline.ingest_price_frame(&frame, now_ms);
            assert_eq!(accepted.len(), 1);
            assert_eq!(accepted[0].price, mock_price(step));
        }
        assert!(build_mock_trade_frame(&config, 0, 0).is_none());
    }

    #[test]
    fn repeated_offline_status_is_throttled() {
        let throttle = Mutex::new(StatusPublishThrottle::default());
        let reason = Some("stream ended".to_string());
        let start = Instant::now();

        assert!(allow_status_publish(
            &throttle,
            ChartConnectionState::Offline,
            &reason,
            start
        ));
        assert!(!allow_status_publish(
            &throttle,
            ChartConnectionState::Offline,
            &reason,
            start + Duration::from_millis(100)
        ));
        assert!(allow_status_publish(
            &throttle,
            ChartConnectionState::Offline,
            &Some("frame error".to_string()),
            start + Duration::from_millis(150)
        ));
        assert!(allow_status_publish(
            &throttle,
            ChartConnectionState::Live,
            &None,
            start + Duration::from_millis(160)
        ));
        assert!(allow_status_publish(
            &throttle,
            ChartConnectionState::Live,
            &None,
            start + Duration::from_millis(170)
        ));
    }

    #[tokio::test]
    async fn mock_pipeline_renders_prices_and_stops_cleanly() {
        let store = Arc::new(MemoryStore::new());
        let config = config(StartChartStreamArgs {
            mock_mode: Some(true),
            ..Default::default()
        });
        let (events, mut events_rx) = broadcast::channel(1_024);
        let (_visibility_tx, visibility) = watch::channel(true);
        let status_store = Arc::new(RwLock::new(ChartStatusSnapshot::idle(
            config.topic.clone(),
            config.symbol.clone(),
            None,
        )));
        let runtime = ChartRuntime {
            cache: PriceCache::new(store.clone()),
            clock: Arc::new(SystemClock),
            http_client: Client::new(),
            status_store: Arc::clone(&status_store),
            events,
            visibility,
        };
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_chart_stream(
            config.clone(),
            runtime,
            cancel_token.clone(),
        ));

        let priced_frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events_rx.recv().await {
                    Ok(ChartEvent::Frame(frame)) if frame.last_price.is_some() => break frame,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("a priced frame should render");
        let price = priced_frame.last_price.unwrap_or_default();
        assert!((MOCK_BASE_PRICE - 15.0..=MOCK_BASE_PRICE + 15.0).contains(&price));

        cancel_token.cancel();
        handle.await.expect("pipeline should stop cleanly");

        let status = status_store.read().await.clone();
        assert_eq!(status.state, ChartConnectionState::Stopped);
        assert!(status.last_tick_ms.is_some());

        let cached = store
            .get("chart-feed:last-price:crypto_prices:BTCUSDT")
            .await
            .expect("memory store is available");
        assert!(cached.is_some());
    }

    fn runtime_with(
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        visible: bool,
    ) -> (ChartRuntime, watch::Sender<bool>, broadcast::Receiver<ChartEvent>) {
        let (events, events_rx) = broadcast::channel(1_024);
        let (visibility_tx, visibility) = watch::channel(visible);
        let runtime = ChartRuntime {
            cache: PriceCache::new(store),
            clock,
            http_client: Client::new(),
            status_store: Arc::new(RwLock::new(ChartStatusSnapshot::idle(
                "crypto_prices".to_string(),
                "btcusdt".to_string(),
                None,
            ))),
            events,
            visibility,
        };
        (runtime, visibility_tx, events_rx)
    }

    #[tokio::test]
    async fn sweeper_publishes_only_when_annotations_expire() {
        let config = watched_config();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runtime, _visibility_tx, mut events_rx) =
            runtime_with(Arc::new(MemoryStore::new()), Arc::clone(&clock), true);
        let pipeline = Arc::new(Mutex::new(ChartPipeline::new(&config)));
        let frame = build_mock_trade_frame(&config, 0, 1_000).expect("watched config");
        assert!(pipeline.lock().ingest_trade_frame(&frame, 1_000).is_some());

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_trade_flow_sweeper(
            runtime,
            Arc::clone(&pipeline),
            cancel_token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(events_rx.try_recv().is_err());

        clock.set(9_500);
        let update = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("sweep should publish")
            .expect("event channel open");
        assert_eq!(
            update,
            ChartEvent::TradeFlow(TradeFlowUpdate {
                annotations: Vec::new()
            })
        );

        cancel_token.cancel();
        handle.await.expect("sweeper should stop");
    }

    #[tokio::test]
    async fn hidden_chart_renders_cached_price_when_shown() {
        let config = config(StartChartStreamArgs {
            stream_url: Some("ws://127.0.0.1:9".to_string()),
            rest_base_url: Some("http://127.0.0.1:9".to_string()),
            mock_mode: Some(false),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        PriceCache::new(store.clone())
            .write(&config.topic, &config.symbol, 42.5, T0 - 5_000)
            .await;
        let clock = Arc::new(ManualClock::new(T0));
        let (runtime, visibility_tx, mut events_rx) = runtime_with(store, clock, false);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_chart_stream(
            config.clone(),
            runtime,
            cancel_token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        visibility_tx.send_replace(true);

        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events_rx.recv().await {
                    Ok(ChartEvent::Frame(frame)) => break frame,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("regaining visibility should render a frame");
        assert_eq!(frame.last_price, Some(42.5));
        assert_eq!(frame.now_ms, T0);

        cancel_token.cancel();
        handle.await.expect("pipeline should stop cleanly");
    }

    #[tokio::test]
    async fn restart_publishes_empty_trade_flow_for_new_context() {
        let config = config(StartChartStreamArgs {
            mock_mode: Some(true),
            ..Default::default()
        });
        let clock = Arc::new(ManualClock::new(T0));
        let (runtime, _visibility_tx, mut events_rx) =
            runtime_with(Arc::new(MemoryStore::new()), clock, true);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_chart_stream(config, runtime, cancel_token.clone()));

        let update = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events_rx.recv().await {
                    Ok(ChartEvent::TradeFlow(update)) => break update,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("startup should publish the trade-flow list");
        assert!(update.annotations.is_empty());

        cancel_token.cancel();
        handle.await.expect("pipeline should stop cleanly");
    }

    #[tokio::test]
    async fn mock_producer_stops_when_trade_consumer_goes_away() {
        let (price_tx, _price_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (trade_tx, trade_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        drop(trade_rx);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_mock_producer(
            watched_config(),
            price_tx,
            Some(trade_tx),
            cancel_token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("producer should exit without cancellation")
            .expect("producer task should not panic");
        assert!(!cancel_token.is_cancelled());
    }
}
