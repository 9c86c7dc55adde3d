//! Chzzk open API client and wire types.
//!
//! The session state machine only talks to the platform through [`OpenApi`], which
//! [`ChzzkClient`] implements over HTTP.

use crate::error::{AuthError, ChannelResolutionError, SubscriptionError};
use crate::oauth::{AuthSession, TokenResponse};
use std::future::Future;

pub mod client;
pub mod types;

pub use client::ChzzkClient;
pub use types::{
    ChannelEndpoint, ChatEvent, ChatProfile, SubscriptionTarget, SystemEvent, SystemEventKind,
};

/// The platform calls a realtime session needs.
pub trait OpenApi: Send + Sync + 'static {
    /// Authenticated lookup of the realtime channel address.
    fn resolve_endpoint(
        &self,
    ) -> impl Future<Output = Result<ChannelEndpoint, ChannelResolutionError>> + Send;

    /// Exchanges the session's authorization code for an access token.
    fn exchange_code(
        &self,
        session: &AuthSession,
    ) -> impl Future<Output = Result<TokenResponse, AuthError>> + Send;

    /// Subscribes the realtime session identified by `session_key` to chat events.
    fn subscribe_chat(
        &self,
        session_key: &str,
        access_token: &str,
    ) -> impl Future<Output = Result<(), SubscriptionError>> + Send;
}
