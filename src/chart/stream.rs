use crate::chart::normalizer::decode_frame;
use crate::chart::types::ChartConnectionState;
use crate::error::AppError;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Live,
    Offline,
    TornDown,
}

impl From<ConnectionPhase> for ChartConnectionState {
    fn from(value: ConnectionPhase) -> Self {
        match value {
            ConnectionPhase::Idle => Self::Idle,
            ConnectionPhase::Connecting => Self::Connecting,
            ConnectionPhase::Live => Self::Live,
            ConnectionPhase::Offline => Self::Offline,
            ConnectionPhase::TornDown => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Closed,
    Opening,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    OpenRequested,
    SocketOpened,
    FrameAccepted,
    SocketClosed,
    ReconnectTimerFired,
    VisibilityChanged { visible: bool },
    Teardown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCommand {
    Connect,
    SendSubscribe,
    ScheduleReconnect { delay_ms: u64 },
    CancelReconnect,
    SendUnsubscribe,
    Close,
}

/// Connection lifecycle as a pure transition function; the driver executes the
/// returned commands.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    phase: ConnectionPhase,
    socket: SocketState,
    visible: bool,
    reconnect_pending: bool,
    reconnect_delay_ms: u64,
    reconnect_attempts: u32,
}

impl ConnectionMachine {
    pub fn new(reconnect_delay_ms: u64, visible: bool) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            socket: SocketState::Closed,
            visible,
            reconnect_pending: false,
            reconnect_delay_ms,
            reconnect_attempts: 0,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionCommand> {
        if self.phase == ConnectionPhase::TornDown {
            // A connect that resolves after teardown still has to be released.
            return match event {
                ConnectionEvent::SocketOpened => vec![ConnectionCommand::Close],
                _ => Vec::new(),
            };
        }

        match event {
            ConnectionEvent::OpenRequested => {
                if self.socket != SocketState::Closed || !self.visible {
                    return Vec::new();
                }
                self.begin_connect()
            }
            ConnectionEvent::SocketOpened => {
                self.socket = SocketState::Open;
                self.phase = ConnectionPhase::Connecting;
                vec![ConnectionCommand::SendSubscribe]
            }
            ConnectionEvent::FrameAccepted => {
                if self.phase == ConnectionPhase::Connecting && self.socket == SocketState::Open {
                    self.phase = ConnectionPhase::Live;
                    self.reconnect_attempts = 0;
                }
                Vec::new()
            }
            ConnectionEvent::SocketClosed => {
                self.socket = SocketState::Closed;
                self.phase = ConnectionPhase::Offline;
                if !self.visible {
                    return Vec::new();
                }
                self.schedule_reconnect()
            }
            ConnectionEvent::ReconnectTimerFired => {
                self.reconnect_pending = false;
                if !self.visible || self.socket != SocketState::Closed {
                    return Vec::new();
                }
                self.begin_connect()
            }
            ConnectionEvent::VisibilityChanged { visible } => {
                self.visible = visible;
                if !visible {
                    return self.cancel_reconnect().into_iter().collect();
                }
                if self.socket != SocketState::Closed {
                    return Vec::new();
                }
                let mut commands: Vec<ConnectionCommand> =
                    self.cancel_reconnect().into_iter().collect();
                commands.extend(self.begin_connect());
                commands
            }
            ConnectionEvent::Teardown => {
                let mut commands: Vec<ConnectionCommand> =
                    self.cancel_reconnect().into_iter().collect();
                match self.socket {
                    SocketState::Open => {
                        commands.push(ConnectionCommand::SendUnsubscribe);
                        commands.push(ConnectionCommand::Close);
                    }
                    SocketState::Opening => commands.push(ConnectionCommand::Close),
                    SocketState::Closed => {}
                }
                self.socket = SocketState::Closed;
                self.phase = ConnectionPhase::TornDown;
                commands
            }
        }
    }

    fn begin_connect(&mut self) -> Vec<ConnectionCommand> {
        self.socket = SocketState::Opening;
        self.phase = ConnectionPhase::Connecting;
        vec![ConnectionCommand::Connect]
    }

    fn schedule_reconnect(&mut self) -> Vec<ConnectionCommand> {
        let mut commands: Vec<ConnectionCommand> = self.cancel_reconnect().into_iter().collect();
        commands.push(ConnectionCommand::ScheduleReconnect {
            delay_ms: self.reconnect_delay_ms,
        });
        self.reconnect_pending = true;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        commands
    }

    fn cancel_reconnect(&mut self) -> Option<ConnectionCommand> {
        if !self.reconnect_pending {
            return None;
        }
        self.reconnect_pending = false;
        Some(ConnectionCommand::CancelReconnect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSubscription {
    pub topic: String,
    pub event_type: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Serialize)]
struct SubscriptionFrameWire<'a> {
    action: SubscriptionAction,
    subscriptions: [SubscriptionWire<'a>; 1],
}

#[derive(Debug, Serialize)]
struct SubscriptionWire<'a> {
    topic: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filters: Option<String>,
}

#[derive(Debug, Serialize)]
struct SymbolFilterWire<'a> {
    symbol: &'a str,
}

/// Builds a subscribe/unsubscribe frame. `filters` is itself a JSON string.
pub fn subscription_frame(
    action: SubscriptionAction,
    subscription: &StreamSubscription,
) -> Result<String, AppError> {
    let filters = subscription
        .symbol
        .as_deref()
        .map(|symbol| serde_json::to_string(&SymbolFilterWire { symbol }))
        .transpose()?;

    let frame = SubscriptionFrameWire {
        action,
        subscriptions: [SubscriptionWire {
            topic: &subscription.topic,
            event_type: &subscription.event_type,
            filters,
        }],
    };
    Ok(serde_json::to_string(&frame)?)
}

pub async fn connect_stream(url: &str) -> Result<FeedWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Frame(Value),
    Phase {
        phase: ConnectionPhase,
        reconnect_attempts: u32,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct StreamConnectionConfig {
    pub url: String,
    pub subscription: StreamSubscription,
    pub reconnect_delay_ms: u64,
}

enum Wake {
    Cancelled,
    Visibility(Option<bool>),
    ReconnectDue,
    Socket(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

struct ConnectionDriver {
    config: StreamConnectionConfig,
    machine: ConnectionMachine,
    socket: Option<FeedWsStream>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    events: mpsc::Sender<StreamEvent>,
    last_published: Option<ConnectionPhase>,
    reason: Option<String>,
    consumer_gone: bool,
}

impl ConnectionDriver {
    async fn apply(&mut self, event: ConnectionEvent, cancel_token: &CancellationToken) {
        let mut queue: VecDeque<ConnectionCommand> = self.machine.handle(event).into();

        while let Some(command) = queue.pop_front() {
            let follow_up = self.execute(command, cancel_token).await;
            if let Some(event) = follow_up {
                queue.extend(self.machine.handle(event));
            }
        }

        self.publish_phase().await;
    }

    async fn execute(
        &mut self,
        command: ConnectionCommand,
        cancel_token: &CancellationToken,
    ) -> Option<ConnectionEvent> {
        match command {
            ConnectionCommand::Connect => {
                self.reason = Some(format!("connecting to {}", self.config.url));
                self.publish_phase().await;
                let result = tokio::select! {
                    _ = cancel_token.cancelled() => return Some(ConnectionEvent::Teardown),
                    result = connect_stream(&self.config.url) => result,
                };
                match result {
                    Ok(stream) => {
                        info!(url = %self.config.url, topic = %self.config.subscription.topic, "stream connected");
                        self.socket = Some(stream);
                        Some(ConnectionEvent::SocketOpened)
                    }
                    Err(error) => {
                        warn!(url = %self.config.url, %error, "stream connect failed");
                        self.reason = Some(format!("connect error: {error}"));
                        Some(ConnectionEvent::SocketClosed)
                    }
                }
            }
            ConnectionCommand::SendSubscribe => {
                match self.send_subscription(SubscriptionAction::Subscribe).await {
                    Ok(()) => {
                        self.reason = Some("subscribed, awaiting first frame".to_string());
                        None
                    }
                    Err(error) => {
                        warn!(%error, "failed to send subscribe frame");
                        self.reason = Some(format!("subscribe failed: {error}"));
                        self.socket = None;
                        Some(ConnectionEvent::SocketClosed)
                    }
                }
            }
            ConnectionCommand::ScheduleReconnect { delay_ms } => {
                debug!(
                    delay_ms,
                    attempt = self.machine.reconnect_attempts(),
                    "scheduling reconnect"
                );
                self.reconnect_timer =
                    Some(Box::pin(tokio::time::sleep(Duration::from_millis(delay_ms))));
                None
            }
            ConnectionCommand::CancelReconnect => {
                self.reconnect_timer = None;
                None
            }
            ConnectionCommand::SendUnsubscribe => {
                if let Err(error) = self.send_subscription(SubscriptionAction::Unsubscribe).await {
                    debug!(%error, "unsubscribe frame not delivered");
                }
                None
            }
            ConnectionCommand::Close => {
                if let Some(mut socket) = self.socket.take() {
                    if let Err(error) = socket.close(None).await {
                        debug!(%error, "socket close was not clean");
                    }
                }
                None
            }
        }
    }

    async fn send_subscription(&mut self, action: SubscriptionAction) -> Result<(), AppError> {
        let frame = subscription_frame(action, &self.config.subscription)?;
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        socket.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn publish_phase(&mut self) {
        let phase = self.machine.phase();
        if self.last_published == Some(phase) && phase != ConnectionPhase::Offline {
            return;
        }
        self.last_published = Some(phase);
        let event = StreamEvent::Phase {
            phase,
            reconnect_attempts: self.machine.reconnect_attempts(),
            reason: self.reason.clone(),
        };
        if self.events.send(event).await.is_err() {
            self.consumer_gone = true;
        }
    }

    async fn on_message(&mut self, message: Message, cancel_token: &CancellationToken) {
        let mut payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(binary) => binary,
            Message::Close(frame) => {
                self.reason = Some(match frame {
                    Some(frame) => format!("closed by server: {}", frame.reason),
                    None => "closed by server".to_string(),
                });
                self.socket = None;
                self.apply(ConnectionEvent::SocketClosed, cancel_token).await;
                return;
            }
            _ => return,
        };

        let frame = match decode_frame(payload.as_mut_slice()) {
            Ok(frame) => frame,
            Err(error) => {
                trace!(%error, "dropping undecodable frame");
                return;
            }
        };

        if self.machine.phase() == ConnectionPhase::Connecting {
            self.reason = Some("receiving frames".to_string());
        }
        self.apply(ConnectionEvent::FrameAccepted, cancel_token).await;
        if self.events.send(StreamEvent::Frame(frame)).await.is_err() {
            self.consumer_gone = true;
        }
    }
}

/// Keeps one subscription alive until `cancel_token` fires or the consumer
/// drops its receiver. Decoded frames and phase changes go to `events`.
pub async fn run_stream_connection(
    config: StreamConnectionConfig,
    mut visibility: watch::Receiver<bool>,
    events: mpsc::Sender<StreamEvent>,
    cancel_token: CancellationToken,
) {
    let visible = *visibility.borrow_and_update();
    let mut driver = ConnectionDriver {
        machine: ConnectionMachine::new(config.reconnect_delay_ms, visible),
        config,
        socket: None,
        reconnect_timer: None,
        events,
        last_published: None,
        reason: None,
        consumer_gone: false,
    };
    let mut visibility_open = true;

    if visible {
        driver
            .apply(ConnectionEvent::OpenRequested, &cancel_token)
            .await;
    } else {
        driver.reason = Some("waiting for visible view".to_string());
        driver.publish_phase().await;
    }

    while !driver.consumer_gone && driver.machine.phase() != ConnectionPhase::TornDown {
        let wake = {
            let reconnect_timer = &mut driver.reconnect_timer;
            let socket = &mut driver.socket;
            tokio::select! {
                _ = cancel_token.cancelled() => Wake::Cancelled,
                changed = visibility.changed(), if visibility_open => match changed {
                    Ok(()) => Wake::Visibility(Some(*visibility.borrow_and_update())),
                    Err(_) => Wake::Visibility(None),
                },
                _ = async {
                    match reconnect_timer.as_mut() {
                        Some(timer) => timer.as_mut().await,
                        None => std::future::pending::<()>().await,
                    }
                } => Wake::ReconnectDue,
                message = async {
                    match socket.as_mut() {
                        Some(stream) => stream.next().await,
                        None => std::future::pending().await,
                    }
                } => Wake::Socket(message),
            }
        };

        match wake {
            Wake::Cancelled => break,
            Wake::Visibility(Some(visible)) => {
                debug!(visible, "view visibility changed");
                driver
                    .apply(ConnectionEvent::VisibilityChanged { visible }, &cancel_token)
                    .await;
            }
            Wake::Visibility(None) => visibility_open = false,
            Wake::ReconnectDue => {
                driver.reconnect_timer = None;
                driver
                    .apply(ConnectionEvent::ReconnectTimerFired, &cancel_token)
                    .await;
            }
            Wake::Socket(Some(Ok(message))) => driver.on_message(message, &cancel_token).await,
            Wake::Socket(Some(Err(error))) => {
                warn!(%error, "stream frame error");
                driver.reason = Some(format!("frame error: {error}"));
                driver.socket = None;
                driver
                    .apply(ConnectionEvent::SocketClosed, &cancel_token)
                    .await;
            }
            Wake::Socket(None) => {
                driver.reason = Some("stream ended".to_string());
                driver.socket = None;
                driver
                    .apply(ConnectionEvent::SocketClosed, &cancel_token)
                    .await;
            }
        }
    }

    driver.reason = Some("stream torn down".to_string());
    let commands = driver.machine.handle(ConnectionEvent::Teardown);
    for command in commands {
        driver.execute(command, &cancel_token).await;
    }
    driver.reconnect_timer = None;
    if !driver.consumer_gone {
        driver.publish_phase().await;
    }
    info!(topic = %driver.config.subscription.topic, "stream connection stopped");
}
