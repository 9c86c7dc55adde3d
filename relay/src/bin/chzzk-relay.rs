use chzzk_chat_relay::authorize;
use chzzk_chat_relay::background::poller::LogHandler;
use chzzk_chat_relay::buffer::{MemoryBuffer, MessageBuffer, PgmqBuffer};
use chzzk_chat_relay::chzzk_api::ChzzkClient;
use chzzk_chat_relay::config::RelayConfig;
use chzzk_chat_relay::oauth::AuthClient;
use chzzk_chat_relay::session::{SessionEvent, SessionStateMachine};
use chzzk_chat_relay::transport::SocketIoConnector;
use clap::Parser;
use eyre::Context;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Relay Chzzk chat into a durable message buffer.
#[derive(Parser, Debug)]
#[command(name = "chzzk-relay")]
#[command(version)]
struct Cli {
    /// Buffer messages in memory instead of the pgmq queue
    #[arg(long)]
    memory_buffer: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "no .env file loaded");
    }
    let config = RelayConfig::from_env().context("load configuration")?;

    if cli.memory_buffer {
        tracing::warn!("buffering in memory; messages are lost when the relay exits");
        let buffer = Arc::new(MemoryBuffer::new());
        relay(config, buffer).await
    } else {
        let buffer = PgmqBuffer::connect(&config.database_url)
            .await
            .context("connect to message buffer database")?;
        relay(config, Arc::new(buffer)).await
    }
}

async fn relay<B: MessageBuffer>(config: RelayConfig, buffer: Arc<B>) -> eyre::Result<()> {
    buffer
        .ensure_queue()
        .await
        .with_context(|| format!("create queue {}", buffer.queue_name()))?;

    let auth_client = AuthClient::new(&config.client_id, &config.client_secret);
    let session = authorize(&config, &auth_client, |url| {
        if let Err(e) = webbrowser::open(url) {
            // the user can still paste the URL by hand
            tracing::warn!(error = %e, "could not open the browser");
            eprintln!("Open this URL to authorize the relay:\n{url}");
        }
        Ok(())
    })
    .await?;
    tracing::info!("authorization code received");

    let machine = SessionStateMachine::new(ChzzkClient::new(auth_client), buffer, session)
        .with_retry(config.retry)
        .with_poller_config(config.poller);

    let mut events = machine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::SubscriptionChanged {
                    kind,
                    event_type,
                    channel_id,
                } => {
                    eprintln!("{} {event_type} on channel {channel_id}", kind.as_str());
                }
                SessionEvent::Error(e) => eprintln!("error: {e}"),
                SessionEvent::System { .. } => {}
            }
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            stop_tx.send_replace(true);
        }
    });

    machine
        .run(&SocketIoConnector, LogHandler, stop_rx)
        .await
        .context("run chat relay session")
}
