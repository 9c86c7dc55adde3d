//! OAuth 2.0 authorization against the Chzzk open API.
//!
//! The platform's token endpoint does not speak the standard form-encoded token exchange, so the
//! exchange is done by hand with `reqwest`. Only CSRF token generation comes from `oauth2`.

use crate::callback::CallbackResult;
use crate::chzzk_api::types::ApiEnvelope;
use crate::error::{AuthError, CallbackError};
use oauth2::CsrfToken;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::instrument;

/// Browser-facing account interlock page that starts the authorization flow.
pub const AUTH_URL: &str = "https://chzzk.naver.com/account-interlock";

/// Base URL of the open API, shared by token exchange and session endpoints.
pub const API_URL: &str = "https://openapi.chzzk.naver.com";

const TOKEN_PATH: &str = "/auth/v1/token";

/// Baseline timeout for the token exchange round-trip.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything but the RFC 3986 unreserved characters.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Generates a fresh URL-safe CSRF state token.
pub fn new_csrf_state() -> String {
    CsrfToken::new_random().secret().clone()
}

/// Token issued by the platform after a successful code exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime of the access token in seconds. The platform sends this as a string.
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in.map(Duration::from_secs)
    }
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(n)) => Ok(Some(n)),
        Some(Seconds::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    state: &'a str,
    redirect_uri: &'a str,
}

/// Builds authorization URLs and exchanges authorization codes for access tokens.
///
/// Nothing in here retries; callers decide whether a failure is worth repeating.
#[derive(Debug, Clone)]
pub struct AuthClient {
    client_id: String,
    client_secret: String,
    auth_url: String,
    token_url: String,
    http: reqwest::Client,
}

impl AuthClient {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self::with_urls(client_id, client_secret, AUTH_URL, API_URL)
    }

    /// Like [`AuthClient::new`], but against different authorization and API hosts.
    pub fn with_urls(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        auth_url: impl Into<String>,
        api_url: &str,
    ) -> Self {
        let http = reqwest::ClientBuilder::new()
            // SSRF no thank you.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(TOKEN_TIMEOUT)
            .build()
            .expect("building reqwest client should not fail");

        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: auth_url.into(),
            token_url: format!("{}{TOKEN_PATH}", api_url.trim_end_matches('/')),
            http,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Returns the URL the user has to visit to grant access.
    ///
    /// The redirect URI is percent-encoded; `state` is embedded as-is and must already be
    /// URL-safe (see [`new_csrf_state`]).
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> String {
        let encoded_redirect = utf8_percent_encode(redirect_uri, URI_COMPONENT);
        format!(
            "{}?response_type=code&clientId={}&redirectUri={}&state={}",
            self.auth_url, self.client_id, encoded_redirect, state
        )
    }

    /// Exchanges an authorization code for an access token.
    ///
    /// Both status and transport failures are logged here and returned to the caller.
    #[instrument(skip(self, code), err)]
    pub async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, AuthError> {
        let body = TokenRequest {
            grant_type: "authorization_code",
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            code,
            state,
            redirect_uri,
        };

        let response = self
            .http
            .post(&self.token_url)
            .header(USER_AGENT, "Mozilla/5.0")
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(&self.client_secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "token exchange request failed");
                AuthError::Transport(e.to_string())
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            tracing::error!(error = %e, "failed to read token exchange response");
            AuthError::Transport(e.to_string())
        })?;

        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %text, "token exchange rejected");
            return Err(AuthError::HttpStatus(status.as_u16(), text));
        }

        let envelope: ApiEnvelope<TokenResponse> =
            serde_json::from_str(&text).map_err(|e| AuthError::Decode(format!("{e}: {text}")))?;
        let token = envelope
            .content
            .ok_or_else(|| AuthError::Decode(format!("no content in response: {text}")))?;

        tracing::debug!(expires_in = ?token.expires_in(), "obtained access token");
        Ok(token)
    }
}

/// Credentials and authorization state for one run of the relay.
///
/// Never persisted; the access token is filled in once the session has been established.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorization_code: String,
    pub csrf_state: String,
    pub access_token: Option<String>,
}

impl AuthSession {
    /// Accepts a captured callback only if it carries a code and the state we generated.
    pub fn from_callback(
        client: &AuthClient,
        redirect_uri: impl Into<String>,
        expected_state: &str,
        callback: CallbackResult,
    ) -> Result<Self, CallbackError> {
        if callback.state.as_deref() != Some(expected_state) {
            tracing::warn!(
                received = ?callback.state,
                "rejecting authorization callback with mismatched state"
            );
            return Err(CallbackError::StateMismatch);
        }
        let authorization_code = callback
            .code
            .filter(|c| !c.is_empty())
            .ok_or(CallbackError::MissingCode)?;

        Ok(Self {
            client_id: client.client_id().to_string(),
            client_secret: client.client_secret().to_string(),
            redirect_uri: redirect_uri.into(),
            authorization_code,
            csrf_state: expected_state.to_string(),
            access_token: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::TestServer;
    use http::StatusCode;
    use pretty_assertions::assert_eq;

    fn callback(code: Option<&str>, state: Option<&str>) -> CallbackResult {
        CallbackResult {
            code: code.map(str::to_string),
            state: state.map(str::to_string),
        }
    }

    #[test]
    fn authorization_url_encodes_redirect() {
        let client = AuthClient::new("my-client", "secret");
        let url = client.authorization_url("http://localhost:8080/callback", "abc_-123");
        assert_eq!(
            url,
            "https://chzzk.naver.com/account-interlock?response_type=code&clientId=my-client\
             &redirectUri=http%3A%2F%2Flocalhost%3A8080%2Fcallback&state=abc_-123"
        );
    }

    #[test]
    fn redirect_is_encoded_as_a_single_component() {
        let client = AuthClient::new("my-client", "secret");
        let url = client.authorization_url("http://localhost/cb?x=a b*~", "s");
        let (_, redirect) = url.split_once("redirectUri=").unwrap();
        assert_eq!(
            redirect,
            "http%3A%2F%2Flocalhost%2Fcb%3Fx%3Da%20b%2A~&state=s"
        );
    }

    #[test]
    fn csrf_state_is_url_safe_and_fresh() {
        let a = new_csrf_state();
        let b = new_csrf_state();
        assert_ne!(a, b);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "{a}"
        );
    }

    #[test]
    fn callback_with_foreign_state_is_rejected() {
        let client = AuthClient::new("id", "secret");
        let expected = new_csrf_state();

        for state in [Some("forged"), None, Some("")] {
            let result = AuthSession::from_callback(
                &client,
                "http://localhost:8080/callback",
                &expected,
                callback(Some("code"), state),
            );
            assert!(
                matches!(result, Err(CallbackError::StateMismatch)),
                "{state:?}: {result:?}"
            );
        }
    }

    #[test]
    fn callback_without_code_is_rejected() {
        let client = AuthClient::new("id", "secret");
        let result = AuthSession::from_callback(
            &client,
            "http://localhost:8080/callback",
            "s",
            callback(None, Some("s")),
        );
        assert!(matches!(result, Err(CallbackError::MissingCode)));
    }

    #[test]
    fn matching_callback_builds_session() {
        let client = AuthClient::new("id", "secret");
        let session = AuthSession::from_callback(
            &client,
            "http://localhost:8080/callback",
            "s",
            callback(Some("the-code"), Some("s")),
        )
        .unwrap();

        assert_eq!(session.authorization_code, "the-code");
        assert_eq!(session.csrf_state, "s");
        assert_eq!(session.client_id, "id");
        assert_eq!(session.access_token, None);
    }

    #[test]
    fn token_response_accepts_string_lifetime() {
        let envelope: ApiEnvelope<TokenResponse> = serde_json::from_str(
            r#"{"code":200,"message":null,"content":{"accessToken":"at","refreshToken":"rt",
                "tokenType":"Bearer","expiresIn":"86400"}}"#,
        )
        .unwrap();
        let token = envelope.content.unwrap();
        assert_eq!(token.access_token, "at");
        assert_eq!(token.expires_in(), Some(Duration::from_secs(86400)));
    }

    #[tokio::test]
    async fn exchange_sends_expected_request() {
        let server = TestServer::respond_with(
            StatusCode::OK,
            r#"{"code":200,"content":{"accessToken":"at","expiresIn":3600}}"#,
        )
        .await;
        let client = AuthClient::with_urls("id", "secret", AUTH_URL, &server.base_url());

        let token = client
            .exchange_code("the-code", "the-state", "http://localhost:8080/callback")
            .await
            .unwrap();
        assert_eq!(token.access_token, "at");
        assert_eq!(token.expires_in, Some(3600));

        let requests = server.requests().await;
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, http::Method::POST);
        assert_eq!(request.path, "/auth/v1/token");
        assert_eq!(request.header("authorization"), Some("Bearer secret"));
        assert_eq!(request.header("user-agent"), Some("Mozilla/5.0"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(
            request.json(),
            serde_json::json!({
                "grantType": "authorization_code",
                "clientId": "id",
                "clientSecret": "secret",
                "code": "the-code",
                "state": "the-state",
                "redirectUri": "http://localhost:8080/callback",
            })
        );
    }

    #[tokio::test]
    async fn rejected_exchange_is_a_typed_error() {
        use insta::assert_snapshot;

        let server =
            TestServer::respond_with(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#)
                .await;
        let client = AuthClient::with_urls("id", "secret", AUTH_URL, &server.base_url());

        let err = client
            .exchange_code("stale", "s", "http://localhost:8080/callback")
            .await
            .unwrap_err();
        match &err {
            AuthError::HttpStatus(400, body) => assert!(body.contains("invalid_grant"), "{body}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_snapshot!(err, @r#"HTTP error 400: {"error":"invalid_grant"}"#);
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_a_transport_error() {
        // bind and immediately drop to get a port nobody listens on
        let addr = {
            let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            socket.local_addr().unwrap()
        };
        let client = AuthClient::with_urls("id", "secret", AUTH_URL, &format!("http://{addr}"));

        let err = client.exchange_code("c", "s", "r").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn success_without_token_is_a_decode_error() {
        let server = TestServer::respond_with(StatusCode::OK, r#"{"code":200}"#).await;
        let client = AuthClient::with_urls("id", "secret", AUTH_URL, &server.base_url());

        let err = client.exchange_code("c", "s", "r").await.unwrap_err();
        assert!(matches!(err, AuthError::Decode(_)), "{err:?}");
    }
}
