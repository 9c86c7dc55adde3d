//! Wire types of the Chzzk open API and of the realtime session channel.

use crate::buffer::ChatMessage;
use crate::error::EventDecodeError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Every open API response is wrapped in this envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub content: Option<T>,
}

/// Address of the realtime channel for one session.
///
/// Obtained once per run through an authenticated lookup; never cached across runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelEndpoint {
    pub url: String,
}

/// Realtime events arrive on named logical subchannels.
pub const SYSTEM_EVENT: &str = "SYSTEM";
pub const CHAT_EVENT: &str = "CHAT";

/// The `{type, data}` envelope of a SYSTEM payload, before the type is interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// SYSTEM event types this relay reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEventKind {
    Connected,
    Subscribed,
    Unsubscribed,
}

impl SystemEventKind {
    /// Returns `None` for types the relay does not know about.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "connected" => Some(Self::Connected),
            "subscribed" => Some(Self::Subscribed),
            "unsubscribed" => Some(Self::Unsubscribed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

/// A decoded SYSTEM event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    Connected { session_key: String },
    Subscribed(SubscriptionTarget),
    Unsubscribed(SubscriptionTarget),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedData {
    session_key: String,
}

/// Which event stream of which channel a (un)subscription refers to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTarget {
    /// `CHAT` or `DONATION`.
    pub event_type: String,
    pub channel_id: String,
}

impl SystemEvent {
    pub fn from_envelope(
        kind: SystemEventKind,
        data: serde_json::Value,
    ) -> Result<Self, EventDecodeError> {
        Ok(match kind {
            SystemEventKind::Connected => {
                let ConnectedData { session_key } = serde_json::from_value(data)?;
                Self::Connected { session_key }
            }
            SystemEventKind::Subscribed => Self::Subscribed(serde_json::from_value(data)?),
            SystemEventKind::Unsubscribed => Self::Unsubscribed(serde_json::from_value(data)?),
        })
    }

    pub fn kind(&self) -> SystemEventKind {
        match self {
            Self::Connected { .. } => SystemEventKind::Connected,
            Self::Subscribed(_) => SystemEventKind::Subscribed,
            Self::Unsubscribed(_) => SystemEventKind::Unsubscribed,
        }
    }
}

/// A chat message as delivered on the CHAT subchannel.
///
/// Only `content` and the sender's nickname matter downstream. Everything else is kept for
/// forward compatibility: a field that is `null` or of an unexpected type falls back to its
/// default instead of rejecting the message.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default, deserialize_with = "lenient")]
    pub channel_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub sender_channel_id: Option<String>,
    pub content: String,
    /// Sent either as an object or as a string holding one.
    #[serde(default, deserialize_with = "lenient_profile")]
    pub profile: Option<ChatProfile>,
    #[serde(default, deserialize_with = "lenient")]
    pub emojis: HashMap<String, serde_json::Value>,
    /// Milliseconds since the epoch, as a number or a numeric string.
    #[serde(default, deserialize_with = "lenient_millis")]
    pub message_time: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub event_sent_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatProfile {
    #[serde(default, deserialize_with = "lenient")]
    pub nickname: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub verified_mark: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub badges: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub user_role_code: Option<String>,
}

/// Falls back to `T::default()` on `null` or on a value that does not fit `T`.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

fn lenient_profile<'de, D>(deserializer: D) -> Result<Option<ChatProfile>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(raw) => serde_json::from_str(&raw).ok(),
        other => ChatProfile::deserialize(other).ok(),
    })
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

impl ChatEvent {
    /// The sender's display name, if the event carries a non-empty one.
    pub fn sender_name(&self) -> Option<&str> {
        self.profile
            .as_ref()
            .and_then(|p| p.nickname.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// Returns the `{sender, message}` pair to buffer, or `None` if either side is empty.
    pub fn to_chat_message(&self) -> Option<ChatMessage> {
        if self.content.is_empty() {
            return None;
        }
        Some(ChatMessage {
            sender: self.sender_name()?.to_string(),
            message: self.content.clone(),
        })
    }
}

/// Decodes a realtime payload that may arrive either as a JSON document or as a string that
/// contains one.
pub fn decode_payload<T: DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, EventDecodeError> {
    match payload {
        serde_json::Value::String(raw) => Ok(serde_json::from_str(raw)?),
        other => Ok(T::deserialize(other)?),
    }
}
