//! Realtime channel transport: Socket.IO (Engine.IO v3) over a websocket.
//!
//! Only the small part of the protocol the session channel needs is implemented: connecting,
//! answering the heartbeat, emitting a single event, and receiving named events. The state
//! machine depends on [`Connector`] and [`RealtimeChannel`], not on this implementation.

use crate::error::ChannelError;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// A named event received on the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFrame {
    pub event: String,
    pub payload: serde_json::Value,
}

/// An open, bidirectional realtime channel.
pub trait RealtimeChannel: Send + 'static {
    /// Emits a plain `message` event.
    fn send_message(&mut self, text: &str)
    -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Waits for the next named event. `None` means the channel was closed.
    fn next_frame(
        &mut self,
    ) -> impl Future<Output = Option<Result<ChannelFrame, ChannelError>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// Opens realtime channels.
pub trait Connector: Send + Sync {
    type Channel: RealtimeChannel;

    fn connect(&self, url: &str) -> impl Future<Output = Result<Self::Channel, ChannelError>> + Send;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SocketIoConnector;

impl Connector for SocketIoConnector {
    type Channel = SocketIoChannel;

    async fn connect(&self, url: &str) -> Result<SocketIoChannel, ChannelError> {
        let ws_url = websocket_url(url)?;
        tracing::debug!(url = %ws_url, "connecting realtime channel");
        let (ws, response) = connect_async(ws_url.as_str()).await?;
        tracing::info!(status = %response.status(), "realtime channel connected");
        Ok(SocketIoChannel::new(ws))
    }
}

/// Rewrites a channel endpoint into the websocket URL of its Socket.IO transport.
pub fn websocket_url(endpoint: &str) -> Result<Url, ChannelError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| ChannelError::Connect(format!("{endpoint}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::Connect(format!(
                "unsupported scheme {other} in {endpoint}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ChannelError::Connect(format!("cannot use {scheme} for {endpoint}")))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/socket.io/");
    }
    url.query_pairs_mut()
        .append_pair("transport", "websocket")
        .append_pair("EIO", "3");
    Ok(url)
}

/// Engine.IO `open` packet contents.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    /// Milliseconds between client pings.
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect,
    Disconnect,
    Event(ChannelFrame),
    Error(String),
    /// Acks and binary packets; the session channel never uses them.
    Other(char),
}

/// Parses one Engine.IO text packet.
pub fn decode_packet(text: &str) -> Result<EnginePacket, ChannelError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ChannelError::Protocol("empty packet".to_string()))?;
    let rest = chars.as_str();
    Ok(match kind {
        '0' => EnginePacket::Open(
            serde_json::from_str(rest)
                .map_err(|e| ChannelError::Protocol(format!("bad open packet {rest:?}: {e}")))?,
        ),
        '1' => EnginePacket::Close,
        '2' => EnginePacket::Ping(rest.to_string()),
        '3' => EnginePacket::Pong(rest.to_string()),
        '4' => EnginePacket::Message(decode_socket_packet(rest)?),
        '6' => EnginePacket::Noop,
        other => {
            return Err(ChannelError::Protocol(format!(
                "unknown engine packet type {other:?}"
            )));
        }
    })
}

fn decode_socket_packet(text: &str) -> Result<SocketPacket, ChannelError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ChannelError::Protocol("empty socket packet".to_string()))?;
    let rest = chars.as_str();
    Ok(match kind {
        '0' => SocketPacket::Connect,
        '1' => SocketPacket::Disconnect,
        '2' => {
            // an optional namespace and ack id precede the JSON array
            let start = rest.find('[').ok_or_else(|| {
                ChannelError::Protocol(format!("event packet without arguments: {text:?}"))
            })?;
            let mut args: Vec<serde_json::Value> = serde_json::from_str(&rest[start..])
                .map_err(|e| ChannelError::Protocol(format!("bad event packet {text:?}: {e}")))?;
            if args.is_empty() {
                return Err(ChannelError::Protocol(format!(
                    "event packet without a name: {text:?}"
                )));
            }
            let name = args.remove(0);
            let serde_json::Value::String(event) = name else {
                return Err(ChannelError::Protocol(format!(
                    "event name is not a string: {text:?}"
                )));
            };
            let payload = if args.is_empty() {
                serde_json::Value::Null
            } else {
                args.remove(0)
            };
            SocketPacket::Event(ChannelFrame { event, payload })
        }
        '4' => SocketPacket::Error(rest.to_string()),
        other => SocketPacket::Other(other),
    })
}

/// Encodes an event emission as an Engine.IO message packet.
pub fn encode_event(event: &str, payload: &serde_json::Value) -> String {
    format!("42{}", serde_json::json!([event, payload]))
}

/// Used until the server tells us its ping interval.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

pub struct SocketIoChannel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    heartbeat: Interval,
}

impl std::fmt::Debug for SocketIoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketIoChannel").finish_non_exhaustive()
    }
}

fn heartbeat(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl SocketIoChannel {
    fn new(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            ws,
            heartbeat: heartbeat(DEFAULT_PING_INTERVAL),
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Handles one websocket text message.
    async fn on_text(&mut self, text: &str) -> Result<Step, ChannelError> {
        match decode_packet(text)? {
            EnginePacket::Open(info) => {
                tracing::debug!(sid = %info.sid, ping_interval = info.ping_interval, "engine open");
                if info.ping_interval > 0 {
                    self.heartbeat = heartbeat(Duration::from_millis(info.ping_interval));
                }
            }
            EnginePacket::Ping(data) => self.send_text(format!("3{data}")).await?,
            EnginePacket::Pong(_) | EnginePacket::Noop => {}
            EnginePacket::Close => return Ok(Step::Closed),
            EnginePacket::Message(SocketPacket::Connect) => {
                tracing::debug!("socket namespace connected");
            }
            EnginePacket::Message(SocketPacket::Event(frame)) => return Ok(Step::Frame(frame)),
            EnginePacket::Message(SocketPacket::Disconnect) => {
                tracing::info!("server disconnected the socket");
                return Ok(Step::Closed);
            }
            EnginePacket::Message(SocketPacket::Error(e)) => {
                return Err(ChannelError::Protocol(format!("socket error: {e}")));
            }
            EnginePacket::Message(SocketPacket::Other(kind)) => {
                tracing::trace!(%kind, "ignoring socket packet");
            }
        }
        Ok(Step::Continue)
    }
}

enum Step {
    Frame(ChannelFrame),
    Continue,
    Closed,
}

impl RealtimeChannel for SocketIoChannel {
    async fn send_message(&mut self, text: &str) -> Result<(), ChannelError> {
        let packet = encode_event("message", &serde_json::Value::from(text));
        self.send_text(packet).await
    }

    async fn next_frame(&mut self) -> Option<Result<ChannelFrame, ChannelError>> {
        loop {
            let message = tokio::select! {
                message = self.ws.next() => message,
                _ = self.heartbeat.tick() => {
                    if let Err(e) = self.send_text("2".to_string()).await {
                        return Some(Err(e));
                    }
                    continue;
                }
            };

            match message? {
                Ok(Message::Text(text)) => match self.on_text(text.as_str()).await {
                    Ok(Step::Frame(frame)) => return Some(Ok(frame)),
                    Ok(Step::Continue) => {}
                    Ok(Step::Closed) => {
                        tracing::info!("realtime channel closed by server");
                        return None;
                    }
                    Err(e) => return Some(Err(e)),
                },
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "realtime channel closed");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
