//! Lifecycle of one realtime session: endpoint lookup, connect, subscription, and dispatch of
//! inbound SYSTEM and CHAT events into the message buffer.

use crate::background::poller::{MessageHandler, Poller, PollerConfig};
use crate::background::stop_requested;
use crate::buffer::MessageBuffer;
use crate::chzzk_api::OpenApi;
use crate::chzzk_api::types::{
    CHAT_EVENT, ChatEvent, SYSTEM_EVENT, SystemEnvelope, SystemEvent, SystemEventKind,
    decode_payload,
};
use crate::error::{SessionError, SubscriptionError};
use crate::oauth::AuthSession;
use crate::retry::RetryPolicy;
use crate::transport::{ChannelFrame, Connector, RealtimeChannel};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Sent as a `message` event right after the channel connects.
pub const HANDSHAKE_MESSAGE: &str = "Hello, server!";

/// Where a session is in its lifecycle.
///
/// States only ever move forward in declaration order; `Disconnected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Init,
    EndpointResolved,
    SocketConnecting,
    SocketConnected,
    SessionEstablished,
    Subscribed,
    Running,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Notifications for observers of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A SYSTEM event of a known type arrived.
    System {
        kind: SystemEventKind,
        data: serde_json::Value,
    },
    /// The server acknowledged a subscribe or an unsubscribe.
    SubscriptionChanged {
        kind: SystemEventKind,
        event_type: String,
        channel_id: String,
    },
    /// Handling an event failed; the session keeps running.
    Error(String),
}

pub struct SessionStateMachine<A, B> {
    api: A,
    buffer: Arc<B>,
    auth: AuthSession,
    retry: RetryPolicy,
    poller: PollerConfig,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    session_key: Option<String>,
}

impl<A, B> SessionStateMachine<A, B>
where
    A: OpenApi,
    B: MessageBuffer,
{
    pub fn new(api: A, buffer: Arc<B>, auth: AuthSession) -> Self {
        let (state, _) = watch::channel(SessionState::Init);
        let (events, _) = broadcast::channel(64);
        Self {
            api,
            buffer,
            auth,
            retry: RetryPolicy::fail_fast(),
            poller: PollerConfig::default(),
            state,
            events,
            session_key: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poller_config(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    /// Key of the realtime session, once the server has announced it.
    pub fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    /// Moves to `to` unless the session is already there or further along.
    fn advance(&self, to: SessionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current >= to {
                return false;
            }
            tracing::info!(from = ?*current, ?to, "session state changed");
            *current = to;
            true
        });
    }

    fn finish(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        tracing::info!(?from, ?to, "session ended");
    }

    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Connects and processes events until the channel closes or `stop` is set.
    ///
    /// The poller drains the buffer into `handler` from the moment the channel connects. On exit
    /// the poller is allowed to finish its current iteration before the channel is released.
    pub async fn run<C, H>(
        mut self,
        connector: &C,
        handler: H,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), SessionError>
    where
        C: Connector,
        H: MessageHandler,
    {
        let api = &self.api;
        let endpoint = match self
            .retry
            .run("resolve channel endpoint", || api.resolve_endpoint())
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!(error = %e, "could not resolve the realtime channel endpoint");
                self.finish(SessionState::Failed);
                return Err(e.into());
            }
        };
        self.advance(SessionState::EndpointResolved);

        self.advance(SessionState::SocketConnecting);
        let url = endpoint.url.as_str();
        let mut channel = match self
            .retry
            .run("connect realtime channel", || connector.connect(url))
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(error = %e, "could not connect the realtime channel");
                self.finish(SessionState::Failed);
                return Err(e.into());
            }
        };
        self.advance(SessionState::SocketConnected);

        let (poller_stop, poller_stop_rx) = watch::channel(false);
        let poller =
            Poller::new(Arc::clone(&self.buffer), self.poller, handler).spawn(poller_stop_rx);

        if let Err(e) = channel.send_message(HANDSHAKE_MESSAGE).await {
            tracing::warn!(error = %e, "failed to send handshake message");
        }

        let outcome = loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    tracing::info!("stop requested");
                    break Ok(());
                }
                frame = channel.next_frame() => match frame {
                    Some(Ok(frame)) => self.dispatch(frame).await,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "realtime channel failed");
                        self.emit(SessionEvent::Error(e.to_string()));
                        break Err(SessionError::from(e));
                    }
                    None => {
                        tracing::info!("realtime channel closed");
                        break Ok(());
                    }
                },
            }
        };

        poller_stop.send_replace(true);
        if let Err(e) = poller.await {
            tracing::error!(error = %e, "poller task panicked");
        }
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "error while closing realtime channel");
        }

        // observers of a terminal state may assume the channel and poller are gone
        self.finish(if outcome.is_ok() {
            SessionState::Disconnected
        } else {
            SessionState::Failed
        });
        outcome
    }

    /// Handles one inbound frame.
    ///
    /// Failures are local to the frame: they are logged and reported as
    /// [`SessionEvent::Error`], and never end the session.
    pub async fn dispatch(&mut self, frame: ChannelFrame) {
        match frame.event.as_str() {
            SYSTEM_EVENT => self.on_system(&frame.payload).await,
            CHAT_EVENT => self.on_chat(&frame.payload).await,
            other => tracing::debug!(event = other, "ignoring event"),
        }
    }

    async fn on_system(&mut self, payload: &serde_json::Value) {
        let envelope: SystemEnvelope = match decode_payload(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, %payload, "skipping malformed system event");
                self.emit(SessionEvent::Error(e.to_string()));
                return;
            }
        };
        let Some(kind) = SystemEventKind::parse(&envelope.kind) else {
            tracing::info!(kind = %envelope.kind, "ignoring unknown system event");
            return;
        };
        let data = envelope.data.clone();
        let event = match SystemEvent::from_envelope(kind, envelope.data) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, ?kind, "skipping malformed system event");
                self.emit(SessionEvent::Error(e.to_string()));
                return;
            }
        };

        match event {
            SystemEvent::Connected { session_key } => {
                tracing::info!(%session_key, "session established");
                self.advance(SessionState::SessionEstablished);
                self.session_key = Some(session_key.clone());
                if let Err(e) = self.subscribe(&session_key).await {
                    tracing::error!(error = %e, "chat subscription failed");
                    self.emit(SessionEvent::Error(e.to_string()));
                    return;
                }
            }
            SystemEvent::Subscribed(target) | SystemEvent::Unsubscribed(target) => {
                tracing::info!(
                    kind = kind.as_str(),
                    event_type = %target.event_type,
                    channel_id = %target.channel_id,
                    "subscription changed"
                );
                self.advance(SessionState::Subscribed);
                self.advance(SessionState::Running);
                self.emit(SessionEvent::SubscriptionChanged {
                    kind,
                    event_type: target.event_type,
                    channel_id: target.channel_id,
                });
            }
        }

        // only reported once the event was handled
        self.emit(SessionEvent::System { kind, data });
    }

    /// Subscribes the session to chat, obtaining the access token first if we have none yet.
    async fn subscribe(&mut self, session_key: &str) -> Result<(), SubscriptionError> {
        let access_token = match &self.auth.access_token {
            Some(token) => token.clone(),
            None => {
                // authorization codes are single use, so this is never retried
                let token = self.api.exchange_code(&self.auth).await?;
                tracing::info!(expires_in = ?token.expires_in(), "obtained access token");
                self.auth.access_token = Some(token.access_token.clone());
                token.access_token
            }
        };

        let api = &self.api;
        let access_token = access_token.as_str();
        self.retry
            .run("subscribe to chat", || {
                api.subscribe_chat(session_key, access_token)
            })
            .await
    }

    async fn on_chat(&mut self, payload: &serde_json::Value) {
        let chat: ChatEvent = match decode_payload(payload) {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!(error = %e, %payload, "skipping malformed chat event");
                return;
            }
        };
        let Some(message) = chat.to_chat_message() else {
            tracing::debug!(?chat, "skipping chat event without sender or content");
            return;
        };

        match self.buffer.push(&message).await {
            Ok(id) => tracing::debug!(id, sender = %message.sender, "buffered chat message"),
            Err(e) => {
                // the event is lost; dropping it is the only option left
                tracing::error!(
                    error = %e,
                    sender = %message.sender,
                    message = %message.message,
                    "dropping chat message that could not be buffered"
                );
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }
}
