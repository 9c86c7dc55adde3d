//! HTTP client for the session endpoints of the Chzzk open API.

use crate::chzzk_api::OpenApi;
use crate::chzzk_api::types::{ApiEnvelope, ChannelEndpoint};
use crate::error::{AuthError, ChannelResolutionError, SubscriptionError};
use crate::oauth::{API_URL, AuthClient, AuthSession, TokenResponse};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::instrument;

/// Upper bound on a single open API request, connection included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the session lookup and event subscription endpoints.
///
/// Endpoint resolution authenticates with the application's client credentials; subscriptions
/// use the user's access token.
#[derive(Debug, Clone)]
pub struct ChzzkClient {
    auth: AuthClient,
    api_url: String,
    http: reqwest::Client,
}

impl ChzzkClient {
    pub fn new(auth: AuthClient) -> Self {
        Self::with_api_url(auth, API_URL)
    }

    pub fn with_api_url(auth: AuthClient, api_url: &str) -> Self {
        Self {
            auth,
            api_url: api_url.trim_end_matches('/').to_string(),
            http: http_client(REQUEST_TIMEOUT),
        }
    }

    /// Replaces the default [`REQUEST_TIMEOUT`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.http = http_client(timeout);
        self
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Looks up the realtime channel address for a new client session.
    #[instrument(skip(self), ret, err)]
    pub async fn resolve_endpoint(&self) -> Result<ChannelEndpoint, ChannelResolutionError> {
        let url = format!("{}/open/v1/sessions/auth/client", self.api_url);
        let response = self
            .http
            .get(&url)
            .header("Client-Id", self.auth.client_id())
            .header("Client-Secret", self.auth.client_secret())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| ChannelResolutionError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChannelResolutionError::Transport(e.to_string()))?;
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), %body, "session auth lookup rejected");
            return Err(ChannelResolutionError::HttpStatus(status.as_u16(), body));
        }

        match serde_json::from_str::<ApiEnvelope<ChannelEndpoint>>(&body) {
            Ok(ApiEnvelope {
                content: Some(endpoint),
                ..
            }) if !endpoint.url.is_empty() => {
                tracing::info!(url = %endpoint.url, "resolved realtime channel endpoint");
                Ok(endpoint)
            }
            Ok(_) => {
                tracing::error!(%body, "session auth response has no content.url");
                Err(ChannelResolutionError::Malformed { body })
            }
            Err(e) => {
                tracing::error!(error = %e, %body, "failed to parse session auth response");
                Err(ChannelResolutionError::Malformed { body })
            }
        }
    }

    /// Subscribes the given realtime session to chat events.
    #[instrument(skip(self, access_token), err)]
    pub async fn subscribe_chat(
        &self,
        session_key: &str,
        access_token: &str,
    ) -> Result<(), SubscriptionError> {
        let url = format!("{}/open/v1/sessions/events/subscribe/chat", self.api_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header(CONTENT_TYPE, "application/json")
            .query(&[("sessionKey", session_key)])
            .send()
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        if !status.is_success() {
            return Err(SubscriptionError::HttpStatus(status.as_u16(), body));
        }

        tracing::info!(status = status.as_u16(), %body, "subscribed to chat events");
        Ok(())
    }
}

impl OpenApi for ChzzkClient {
    async fn resolve_endpoint(&self) -> Result<ChannelEndpoint, ChannelResolutionError> {
        ChzzkClient::resolve_endpoint(self).await
    }

    async fn exchange_code(&self, session: &AuthSession) -> Result<TokenResponse, AuthError> {
        self.auth
            .exchange_code(
                &session.authorization_code,
                &session.csrf_state,
                &session.redirect_uri,
            )
            .await
    }

    async fn subscribe_chat(
        &self,
        session_key: &str,
        access_token: &str,
    ) -> Result<(), SubscriptionError> {
        ChzzkClient::subscribe_chat(self, session_key, access_token).await
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        // SSRF no thank you.
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .expect("building reqwest client should not fail")
}
