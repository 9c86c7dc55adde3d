use crate::callback::CallbackListener;
use crate::config::RelayConfig;
use crate::oauth::{AuthClient, AuthSession};
use eyre::Context;

pub mod background;
pub mod buffer;
pub mod callback;
pub mod chzzk_api;
pub mod config;
pub mod error;
pub mod oauth;
pub mod retry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_server;

/// Runs the interactive authorization phase.
///
/// Starts the callback listener, hands the authorization URL to `open_url` (normally the user's
/// browser), and waits for the redirect. The listener is torn down before this returns, whatever
/// the outcome.
pub async fn authorize<F>(
    config: &RelayConfig,
    client: &AuthClient,
    open_url: F,
) -> eyre::Result<AuthSession>
where
    F: FnOnce(&str) -> eyre::Result<()>,
{
    let csrf_state = oauth::new_csrf_state();
    let listener = CallbackListener::start(config.callback_addr.as_str())
        .await
        .with_context(|| format!("start callback listener on {}", config.callback_addr))?;

    let auth_url = client.authorization_url(&config.redirect_uri, &csrf_state);
    tracing::info!(%auth_url, "waiting for user authorization");
    open_url(&auth_url).context("open authorization URL")?;

    let callback = listener
        .await_result(config.callback_timeout)
        .await
        .context("await authorization callback")?;

    AuthSession::from_callback(client, &config.redirect_uri, &csrf_state, callback)
        .context("accept authorization callback")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;

    /// Configuration for a listener on a free local port.
    fn config() -> (RelayConfig, SocketAddr) {
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);

        let config = RelayConfig::from_lookup(|key| match key {
            "CLIENT_ID" => Some("client-id".to_string()),
            "CLIENT_SECRET" => Some("client-secret".to_string()),
            "CALLBACK_ADDR" => Some(addr.to_string()),
            "CALLBACK_TIMEOUT_SECS" => Some("5".to_string()),
            _ => None,
        })
        .unwrap();
        (config, addr)
    }

    /// Pulls the `state` parameter back out of an authorization URL.
    fn state_of(auth_url: &str) -> String {
        let query = auth_url.split_once('?').unwrap().1;
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "state")
            .unwrap()
            .1
            .into_owned()
    }

    #[tokio::test]
    async fn authorize_round_trip() {
        let (config, addr) = config();
        let client = AuthClient::new("client-id", "client-secret");

        let session = authorize(&config, &client, |auth_url| {
            let state = state_of(auth_url);
            tokio::spawn(async move {
                let url = format!("http://{addr}/callback?code=code-1&state={state}");
                reqwest::get(url).await.unwrap();
            });
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(session.authorization_code, "code-1");
        assert_eq!(session.client_id, "client-id");
        assert_eq!(session.access_token, None);
    }

    #[tokio::test]
    async fn authorize_rejects_forged_state() {
        let (config, addr) = config();
        let client = AuthClient::new("client-id", "client-secret");

        let err = authorize(&config, &client, |_| {
            tokio::spawn(async move {
                let url = format!("http://{addr}/callback?code=code-1&state=forged");
                reqwest::get(url).await.unwrap();
            });
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(
            matches!(
                err.downcast_ref::<CallbackError>(),
                Some(CallbackError::StateMismatch)
            ),
            "{err:?}"
        );
    }
}
