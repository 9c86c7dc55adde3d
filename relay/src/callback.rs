//! One-shot local listener that captures the OAuth redirect.
//!
//! The listener serves `GET /callback` exactly once: the first matching request delivers its
//! `code` and `state` to the waiting caller and then asks the accept loop to stop. The accept loop
//! runs on its own task, so the shutdown request never blocks the connection that triggered it.

use crate::error::CallbackError;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response, body};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;

const CALLBACK_PATH: &str = "/callback";

const CALLBACK_DONE: &str = include_str!("../callback_success.html");

/// Query parameters captured from the redirect. Either may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    pub code: Option<String>,
    pub state: Option<String>,
}

/// Single-slot handoff between the request handler and [`CallbackListener::await_result`].
type ResultSlot = Arc<Mutex<Option<oneshot::Sender<CallbackResult>>>>;

/// A running callback listener.
///
/// Dropping the listener also stops it, but [`CallbackListener::await_result`] is the only way to
/// wait until the port has actually been released.
#[derive(Debug)]
pub struct CallbackListener {
    local_addr: SocketAddr,
    result: oneshot::Receiver<CallbackResult>,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
}

impl CallbackListener {
    /// Binds `addr` and starts serving in the background.
    pub async fn start(addr: impl ToSocketAddrs) -> Result<Self, CallbackError> {
        let socket = TcpListener::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let slot: ResultSlot = Arc::new(Mutex::new(Some(tx)));
        let server = tokio::spawn(accept_loop(socket, slot, shutdown.clone(), shutdown_rx));
        tracing::info!(%local_addr, "callback listener started");

        Ok(Self {
            local_addr,
            result: rx,
            shutdown,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the redirect to arrive, or for `timeout` to elapse.
    ///
    /// Either way the listener is shut down and its port released before this returns.
    pub async fn await_result(
        mut self,
        timeout: Duration,
    ) -> Result<CallbackResult, CallbackError> {
        let outcome = match tokio::time::timeout(timeout, &mut self.result).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CallbackError::Closed),
            Err(_) => {
                tracing::warn!(?timeout, "no authorization callback received in time");
                Err(CallbackError::Timeout)
            }
        };

        self.shutdown.send_replace(true);
        if let Err(e) = (&mut self.server).await {
            tracing::warn!(error = %e, "callback listener task failed");
        }
        tracing::debug!(local_addr = %self.local_addr, "callback listener stopped");
        outcome
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    socket: TcpListener,
    slot: ResultSlot,
    shutdown: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            accepted = socket.accept() => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept callback connection");
                        continue;
                    }
                };
                tracing::trace!(%peer, "accepted callback connection");
                tokio::spawn(serve_connection(
                    conn,
                    slot.clone(),
                    shutdown.clone(),
                    shutdown.subscribe(),
                ));
            }
        }
    }
    // dropping `socket` here releases the port
}

async fn serve_connection(
    conn: tokio::net::TcpStream,
    slot: ResultSlot,
    shutdown: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let conn = hyper_util::rt::TokioIo::new(conn);
    let service = service_fn(move |req: Request<body::Incoming>| {
        let slot = slot.clone();
        let shutdown = shutdown.clone();
        async move { Ok::<_, Infallible>(handle_request(req, &slot, &shutdown).await) }
    });
    let mut serve =
        std::pin::pin!(hyper::server::conn::http1::Builder::new().serve_connection(conn, service));

    tokio::select! {
        exit = &mut serve => {
            if let Err(e) = exit {
                tracing::debug!(error = %e, "callback connection ended with error");
            }
            return;
        }
        _ = shutdown_rx.wait_for(|stop| *stop) => {}
    }
    serve.as_mut().graceful_shutdown();
    if let Err(e) = serve.await {
        tracing::debug!(error = %e, "callback connection ended with error");
    }
}

async fn handle_request(
    req: Request<body::Incoming>,
    slot: &ResultSlot,
    shutdown: &watch::Sender<bool>,
) -> Response<Full<Bytes>> {
    if req.method() != Method::GET || req.uri().path() != CALLBACK_PATH {
        tracing::debug!(method = %req.method(), path = req.uri().path(), "not the callback path");
        return status_only(StatusCode::NOT_FOUND);
    }

    let mut code = None;
    let mut state = None;
    for (k, v) in form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes()) {
        match &*k {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            _ => {}
        }
    }

    let Some(tx) = slot.lock().await.take() else {
        tracing::warn!("ignoring repeated authorization callback");
        return status_only(StatusCode::GONE);
    };

    tracing::info!(has_code = code.is_some(), ?state, "authorization callback received");
    // the receiver may have timed out already; the listener is shutting down either way
    let _ = tx.send(CallbackResult { code, state });
    shutdown.send_replace(true);

    let mut response = Response::new(Full::new(Bytes::from_static(CALLBACK_DONE.as_bytes())));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
