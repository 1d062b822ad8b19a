use crate::error::AppError;
use crate::market::clock::now_unix_ms;
use crate::market::rest::epoch_to_ms;
use crate::market::types::{ConnectionState, Tick};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const BACKOFF_FLOOR_MS: u64 = 450;
pub const BACKOFF_CAP_MS: u64 = 8_000;
pub const BACKOFF_GROWTH: f64 = 1.35;
pub const MAX_JITTER_MS: u64 = 350;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(45);
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

pub type LiveWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub floor_ms: u64,
    pub cap_ms: u64,
    pub growth: f64,
    pub max_jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor_ms: BACKOFF_FLOOR_MS,
            cap_ms: BACKOFF_CAP_MS,
            growth: BACKOFF_GROWTH,
            max_jitter_ms: MAX_JITTER_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Connection lifecycle and subscription bookkeeping, free of any I/O.
#[derive(Debug)]
pub struct LiveSocketMachine {
    policy: BackoffPolicy,
    state: ConnectionState,
    backoff_ms: u64,
    wanted: Option<String>,
    subscribed: Option<String>,
    reconnect_attempt: u32,
}

impl LiveSocketMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            backoff_ms: policy.floor_ms,
            wanted: None,
            subscribed: None,
            reconnect_attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn wanted(&self) -> Option<&str> {
        self.wanted.as_deref()
    }

    /// No-op while a connection is already being opened or is open.
    pub fn begin_connect(&mut self) -> bool {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Resets backoff and replays the wanted subscription.
    pub fn on_open(&mut self) -> Vec<ControlCommand> {
        self.state = ConnectionState::Open;
        self.backoff_ms = self.policy.floor_ms;
        self.reconnect_attempt = 0;
        self.subscribed = self.wanted.clone();
        self.wanted
            .iter()
            .cloned()
            .map(ControlCommand::Subscribe)
            .collect()
    }

    /// Records the new wanted instrument; only emits commands while open.
    pub fn set_wanted(&mut self, instrument: Option<String>) -> Vec<ControlCommand> {
        self.wanted = instrument;
        if self.state != ConnectionState::Open || self.subscribed == self.wanted {
            return Vec::new();
        }

        let mut commands = Vec::with_capacity(2);
        if let Some(previous) = self.subscribed.take() {
            commands.push(ControlCommand::Unsubscribe(previous));
        }
        if let Some(next) = self.wanted.clone() {
            commands.push(ControlCommand::Subscribe(next));
        }
        self.subscribed = self.wanted.clone();
        commands
    }

    /// `delay = min(cap, backoff + jitter)`, then `backoff = min(cap, backoff × growth)`.
    pub fn on_disconnect(&mut self, failed: bool, jitter_ms: u64) -> Duration {
        self.state = if failed {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        };
        self.subscribed = None;
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);

        let jitter_ms = jitter_ms.min(self.policy.max_jitter_ms);
        let delay_ms = self
            .backoff_ms
            .saturating_add(jitter_ms)
            .min(self.policy.cap_ms);
        let grown = (self.backoff_ms as f64 * self.policy.growth).round() as u64;
        self.backoff_ms = grown.min(self.policy.cap_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn begin_close(&mut self) {
        self.state = ConnectionState::Closing;
    }

    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.subscribed = None;
    }

    /// Ticks are accepted only for the exact wanted instrument.
    pub fn accepts_tick(&self, instrument: &str) -> bool {
        self.wanted.as_deref() == Some(instrument)
    }
}

#[derive(Debug, Serialize)]
struct ControlFrameWire<'a> {
    action: &'a str,
    #[serde(flatten)]
    markets: BTreeMap<&'a str, [&'a str; 1]>,
}

pub fn encode_control(market_key: &str, command: &ControlCommand) -> Result<String, AppError> {
    let (action, instrument) = match command {
        ControlCommand::Subscribe(instrument) => ("subscribe", instrument.as_str()),
        ControlCommand::Unsubscribe(instrument) => ("unsubscribe", instrument.as_str()),
    };
    let frame = ControlFrameWire {
        action,
        markets: BTreeMap::from([(market_key, [instrument])]),
    };
    Ok(simd_json::to_string(&frame)?)
}

pub fn encode_pong() -> String {
    r#"{"action":"pong"}"#.to_string()
}

#[derive(Debug, Deserialize)]
struct TickWire {
    #[serde(alias = "symbol", alias = "display")]
    instrument: String,
    #[serde(default)]
    mid: Option<f64>,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
    #[serde(default, alias = "t", alias = "time")]
    ts: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InboundWire {
    Hello {},
    Tick(TickWire),
    Ping,
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Hello,
    Tick { instrument: String, tick: Tick },
    Heartbeat,
    Ignored,
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|price| price.is_finite() && *price > 0.0)
}

fn tick_price(wire: &TickWire) -> Option<f64> {
    positive(wire.mid).or_else(|| match (positive(wire.bid), positive(wire.ask)) {
        (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
        (Some(side), None) | (None, Some(side)) => Some(side),
        (None, None) => None,
    })
}

/// Unparseable or unknown payloads decode to `Ignored`.
pub fn decode_inbound(payload: &mut [u8], now_ms: i64) -> InboundMessage {
    let Ok(wire) = simd_json::serde::from_slice::<InboundWire>(payload) else {
        return InboundMessage::Ignored;
    };

    match wire {
        InboundWire::Hello {} => InboundMessage::Hello,
        InboundWire::Ping | InboundWire::Heartbeat => InboundMessage::Heartbeat,
        InboundWire::Unknown => InboundMessage::Ignored,
        InboundWire::Tick(tick) => {
            let Some(price) = tick_price(&tick) else {
                return InboundMessage::Ignored;
            };
            let t = tick
                .ts
                .filter(|ts| ts.is_finite() && *ts > 0.0)
                .map(epoch_to_ms)
                .unwrap_or(now_ms);
            InboundMessage::Tick {
                instrument: tick.instrument.trim().to_ascii_uppercase(),
                tick: Tick { t, p: price },
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveSocketConfig {
    pub url: String,
    pub market_key: String,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub policy: BackoffPolicy,
}

impl LiveSocketConfig {
    pub fn new(url: impl Into<String>, market_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            market_key: market_key.into(),
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: IDLE_READ_TIMEOUT,
            policy: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Watch(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    State {
        state: ConnectionState,
        reconnect_attempt: u32,
        next_reconnect_ms: Option<u64>,
        reason: Option<String>,
    },
    Hello,
    Tick {
        instrument: String,
        tick: Tick,
    },
}

pub struct LiveSocketHandle {
    pub commands: mpsc::UnboundedSender<SocketCommand>,
    pub events: mpsc::Receiver<SocketEvent>,
    pub join_handle: JoinHandle<()>,
}

enum SessionEnd {
    Cancelled,
    Closed(String),
    Failed(AppError),
}

fn transport_failure(context: &str, error: impl std::fmt::Display) -> SessionEnd {
    SessionEnd::Failed(AppError::Transport(format!("{context}: {error}")))
}

pub async fn connect_live_socket(url: &str) -> Result<LiveWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };
    let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
    Ok(stream)
}

pub fn spawn_live_socket(
    config: LiveSocketConfig,
    initial_wanted: Option<String>,
    cancel: CancellationToken,
) -> LiveSocketHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut machine = LiveSocketMachine::new(config.policy);
    machine.set_wanted(initial_wanted);

    let join_handle = tokio::spawn(run_live_socket(
        config, machine, command_rx, event_tx, cancel,
    ));

    LiveSocketHandle {
        commands: command_tx,
        events: event_rx,
        join_handle,
    }
}

async fn emit_state(
    events: &mpsc::Sender<SocketEvent>,
    machine: &LiveSocketMachine,
    next_reconnect_ms: Option<u64>,
    reason: Option<String>,
) {
    let _ = events
        .send(SocketEvent::State {
            state: machine.state(),
            reconnect_attempt: machine.reconnect_attempt(),
            next_reconnect_ms,
            reason,
        })
        .await;
}

async fn run_live_socket(
    config: LiveSocketConfig,
    mut machine: LiveSocketMachine,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::Sender<SocketEvent>,
    cancel: CancellationToken,
) {
    'reconnect: while !cancel.is_cancelled() {
        machine.begin_connect();
        emit_state(&events, &machine, None, Some("opening live socket".to_string())).await;

        let connect = tokio::time::timeout(config.connect_timeout, connect_live_socket(&config.url));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect => result,
        };

        let end = match outcome {
            Ok(Ok(stream)) => {
                let replay = machine.on_open();
                info!(url = %config.url, "live socket open");
                emit_state(&events, &machine, None, Some("live socket open".to_string())).await;
                run_session(stream, &config, &mut machine, replay, &mut commands, &events, &cancel)
                    .await
            }
            Ok(Err(error)) => transport_failure("connect error", error),
            Err(_) => SessionEnd::Failed(AppError::Transport("connect timed out".to_string())),
        };

        let (failed, reason) = match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Closed(reason) => (false, reason),
            SessionEnd::Failed(error) => (true, format!("{error} [{}]", error.code())),
        };
        if cancel.is_cancelled() {
            break;
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=config.policy.max_jitter_ms);
        let delay = machine.on_disconnect(failed, jitter_ms);
        warn!(
            attempt = machine.reconnect_attempt(),
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "live socket dropped"
        );
        emit_state(&events, &machine, Some(delay.as_millis() as u64), Some(reason)).await;

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'reconnect,
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(SocketCommand::Watch(instrument)) => {
                        machine.set_wanted(instrument);
                    }
                    None => break 'reconnect,
                },
            }
        }
    }

    machine.on_closed();
    emit_state(&events, &machine, None, Some("live socket closed".to_string())).await;
}

async fn send_controls(
    sink: &mut futures_util::stream::SplitSink<LiveWsStream, Message>,
    market_key: &str,
    controls: Vec<ControlCommand>,
) -> Result<(), AppError> {
    for control in controls {
        let payload = encode_control(market_key, &control)?;
        debug!(?control, "live socket control");
        sink.send(Message::Text(payload)).await?;
    }
    Ok(())
}

async fn close_normally(sink: &mut futures_util::stream::SplitSink<LiveWsStream, Message>) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed("session closed"),
    };
    if let Err(error) = sink.send(Message::Close(Some(frame))).await {
        debug!(%error, "live socket close frame not delivered");
    }
}

async fn run_session(
    stream: LiveWsStream,
    config: &LiveSocketConfig,
    machine: &mut LiveSocketMachine,
    replay: Vec<ControlCommand>,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &mpsc::Sender<SocketEvent>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut sink, mut source) = stream.split();
    if let Err(error) = send_controls(&mut sink, &config.market_key, replay).await {
        return transport_failure("subscribe failed", error);
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                machine.begin_close();
                close_normally(&mut sink).await;
                return SessionEnd::Cancelled;
            }
            command = commands.recv() => {
                let Some(SocketCommand::Watch(instrument)) = command else {
                    machine.begin_close();
                    close_normally(&mut sink).await;
                    return SessionEnd::Cancelled;
                };
                let controls = machine.set_wanted(instrument);
                if let Err(error) = send_controls(&mut sink, &config.market_key, controls).await {
                    return transport_failure("subscription change failed", error);
                }
                continue;
            }
            frame = tokio::time::timeout(config.idle_timeout, source.next()) => frame,
        };

        let message = match next {
            Err(_) => {
                return SessionEnd::Failed(AppError::Transport(
                    "no data within idle timeout".to_string(),
                ))
            }
            Ok(None) => return SessionEnd::Closed("live socket stream ended".to_string()),
            Ok(Some(Err(error))) => return transport_failure("frame error", error),
            Ok(Some(Ok(message))) => message,
        };

        let mut payload = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return SessionEnd::Closed("server closed live socket".to_string()),
            _ => continue,
        };

        match decode_inbound(payload.as_mut_slice(), now_unix_ms()) {
            InboundMessage::Tick { instrument, tick } => {
                if !machine.accepts_tick(&instrument) {
                    continue;
                }
                if events.send(SocketEvent::Tick { instrument, tick }).await.is_err() {
                    close_normally(&mut sink).await;
                    return SessionEnd::Cancelled;
                }
            }
            InboundMessage::Heartbeat => {
                if let Err(error) = sink.send(Message::Text(encode_pong())).await {
                    return transport_failure("heartbeat reply failed", error);
                }
            }
            InboundMessage::Hello => {
                let _ = events.send(SocketEvent::Hello).await;
            }
            InboundMessage::Ignored => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn backoff_grows_monotonically_to_cap() {
        let mut machine = LiveSocketMachine::new(BackoffPolicy::default());
        let mut previous = Duration::ZERO;
        for _ in 0..30 {
            machine.begin_connect();
            let delay = machine.on_disconnect(true, 0);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(BACKOFF_CAP_MS));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(BACKOFF_CAP_MS));
        assert_eq!(machine.state(), ConnectionState::Error);
    }

    #[test]
    fn begin_connect_is_a_noop_while_connecting_or_open() {
        let mut machine = LiveSocketMachine::new(BackoffPolicy::default());
        assert!(machine.begin_connect());
        assert!(!machine.begin_connect());
        assert_eq!(machine.state(), ConnectionState::Connecting);

        machine.on_open();
        assert!(!machine.begin_connect());
        assert_eq!(machine.state(), ConnectionState::Open);

        machine.on_disconnect(true, 0);
        assert!(machine.begin_connect());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn first_delay_starts_at_floor_plus_bounded_jitter() {
        let mut machine = LiveSocketMachine::new(BackoffPolicy::default());
        assert_eq!(machine.on_disconnect(true, 10_000), Duration::from_millis(800));
        assert_eq!(machine.backoff_ms(), 608);
    }

    #[test]
    fn open_resets_backoff_and_replays_subscription() {
        let mut machine = LiveSocketMachine::new(BackoffPolicy::default());
        assert!(machine.set_wanted(Some("EURUSD".to_string())).is_empty());
        machine.on_disconnect(true, 0);
        machine.on_disconnect(true, 0);
        assert!(machine.backoff_ms() > BACKOFF_FLOOR_MS);

        machine.begin_connect();
        let replay = machine.on_open();
        assert_eq!(replay, vec![ControlCommand::Subscribe("EURUSD".to_string())]);
        assert_eq!(machine.backoff_ms(), BACKOFF_FLOOR_MS);
        assert_eq!(machine.reconnect_attempt(), 0);
    }

    #[test]
    fn switching_while_open_unsubscribes_then_subscribes() {
        let mut machine = LiveSocketMachine::new(BackoffPolicy::default());
        machine.set_wanted(Some("EURUSD".to_string()));
        machine.on_open();

        assert_eq!(
            machine.set_wanted(Some("GBPUSD".to_string())),
            vec![
                ControlCommand::Unsubscribe("EURUSD".to_string()),
                ControlCommand::Subscribe("GBPUSD".to_string()),
            ]
        );
        assert!(machine.set_wanted(Some("GBPUSD".to_string())).is_empty());
        assert!(machine.accepts_tick("GBPUSD"));
        assert!(!machine.accepts_tick("EURUSD"));
        assert!(!machine.accepts_tick("gbpusd"));
    }

    #[test]
    fn encodes_control_frames_keyed_by_market() {
        let payload = encode_control("forex", &ControlCommand::Subscribe("EURUSD".to_string()))
            .expect("control frame should encode");
        assert_eq!(payload, r#"{"action":"subscribe","forex":["EURUSD"]}"#);
    }

    #[test]
    fn decodes_inbound_messages() {
        let mut tick = br#"{"type":"tick","instrument":"eurusd","bid":1.1,"ask":1.1002,"ts":1700000000}"#.to_vec();
        assert_eq!(
            decode_inbound(&mut tick, 0),
            InboundMessage::Tick {
                instrument: "EURUSD".to_string(),
                tick: Tick {
                    t: 1_700_000_000_000,
                    p: 1.1001,
                },
            }
        );

        let mut mid = br#"{"type":"tick","instrument":"USDJPY","mid":150.5}"#.to_vec();
        assert_eq!(
            decode_inbound(&mut mid, 42),
            InboundMessage::Tick {
                instrument: "USDJPY".to_string(),
                tick: Tick { t: 42, p: 150.5 },
            }
        );

        let mut hello = br#"{"type":"hello","server":"v2"}"#.to_vec();
        assert_eq!(decode_inbound(&mut hello, 0), InboundMessage::Hello);
        let mut ping = br#"{"type":"ping"}"#.to_vec();
        assert_eq!(decode_inbound(&mut ping, 0), InboundMessage::Heartbeat);
        let mut other = br#"{"type":"news","body":"x"}"#.to_vec();
        assert_eq!(decode_inbound(&mut other, 0), InboundMessage::Ignored);
        let mut garbage = b"not json".to_vec();
        assert_eq!(decode_inbound(&mut garbage, 0), InboundMessage::Ignored);
        let mut priceless = br#"{"type":"tick","instrument":"EURUSD"}"#.to_vec();
        assert_eq!(decode_inbound(&mut priceless, 0), InboundMessage::Ignored);
    }

    #[derive(Debug, Deserialize)]
    struct ControlEcho {
        action: String,
        #[serde(flatten)]
        markets: BTreeMap<String, Vec<String>>,
    }

    async fn next_text(
        ws: &mut WebSocketStream<TcpStream>,
    ) -> Option<String> {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                return Some(text);
            }
        }
        None
    }

    async fn next_event(events: &mut mpsc::Receiver<SocketEvent>) -> SocketEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event should arrive")
            .expect("channel should stay open")
    }

    #[tokio::test]
    async fn runner_subscribes_routes_ticks_answers_heartbeats_and_closes_normally() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let address = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");

            let mut subscribe = next_text(&mut ws).await.expect("subscribe frame").into_bytes();
            let echo: ControlEcho =
                simd_json::serde::from_slice(&mut subscribe).expect("control frame json");
            assert_eq!(echo.action, "subscribe");
            assert_eq!(echo.markets.get("forex"), Some(&vec!["EURUSD".to_string()]));

            for payload in [
                r#"{"type":"hello"}"#,
                r#"{"type":"tick","instrument":"GBPUSD","mid":1.27,"ts":1000}"#,
                r#"{"type":"tick","instrument":"EURUSD","mid":1.1,"ts":2000}"#,
                r#"{"type":"heartbeat"}"#,
            ] {
                ws.send(Message::Text(payload.to_string())).await.expect("send");
            }

            let pong = next_text(&mut ws).await.expect("pong frame");
            assert_eq!(pong, encode_pong());

            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        return frame.map(|frame| frame.code);
                    }
                    Some(Ok(_)) => continue,
                    _ => return None,
                }
            }
        });

        let cancel = CancellationToken::new();
        let config = LiveSocketConfig::new(format!("ws://{address}"), "forex");
        let mut handle = spawn_live_socket(config, Some("EURUSD".to_string()), cancel.clone());

        let mut saw_open = false;
        let mut saw_hello = false;
        let tick = loop {
            match next_event(&mut handle.events).await {
                SocketEvent::State { state: ConnectionState::Open, .. } => saw_open = true,
                SocketEvent::Hello => saw_hello = true,
                SocketEvent::Tick { instrument, tick } => break (instrument, tick),
                SocketEvent::State { .. } => {}
            }
        };
        assert!(saw_open);
        assert!(saw_hello);
        assert_eq!(tick, ("EURUSD".to_string(), Tick { t: 2_000_000, p: 1.1 }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let close_code = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should finish")
            .expect("server task should not panic");
        assert_eq!(close_code, Some(CloseCode::Normal));

        handle.join_handle.await.expect("runner should exit");
    }

    #[tokio::test]
    async fn runner_reports_error_and_backoff_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let address = listener.local_addr().expect("local addr");
        drop(listener);

        let cancel = CancellationToken::new();
        let config = LiveSocketConfig::new(format!("ws://{address}"), "forex");
        let mut handle = spawn_live_socket(config, Some("EURUSD".to_string()), cancel.clone());

        let delay = loop {
            if let SocketEvent::State {
                state: ConnectionState::Error,
                next_reconnect_ms,
                reconnect_attempt,
                reason,
            } = next_event(&mut handle.events).await
            {
                assert_eq!(reconnect_attempt, 1);
                let reason = reason.expect("failure reason should be reported");
                assert!(reason.starts_with("transport error: connect error"));
                assert!(reason.ends_with("[transport_error]"));
                break next_reconnect_ms;
            }
        };
        let delay = delay.expect("retry delay should be scheduled");
        assert!((BACKOFF_FLOOR_MS..=BACKOFF_FLOOR_MS + MAX_JITTER_MS).contains(&delay));

        cancel.cancel();
        handle.join_handle.await.expect("runner should exit");
    }
}
