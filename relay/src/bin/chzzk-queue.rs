//! Inspect the relay's message buffer.
//!
//! `chzzk-queue` prints the queue depth; `chzzk-queue drain [N]` consumes and prints up to `N`
//! messages (default 10).

use chzzk_chat_relay::buffer::{MessageBuffer, PgmqBuffer};
use chzzk_chat_relay::config::RelayConfig;
use clap::{Parser, Subcommand};
use eyre::Context;
use std::io::IsTerminal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chzzk-queue")]
#[command(about = "Inspect the chat relay's message buffer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Print the number of buffered messages
    Count,

    /// Consume and print buffered messages
    Drain {
        /// Maximum number of messages to drain (defaults to the poller batch size)
        n: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "no .env file loaded");
    }
    let config = RelayConfig::from_env().context("load configuration")?;
    let buffer = PgmqBuffer::connect(&config.database_url)
        .await
        .context("connect to message buffer database")?;
    buffer.ensure_queue().await.context("create queue")?;

    match cli.command.unwrap_or(Command::Count) {
        Command::Count => {
            let count = buffer.count().await.context("count messages")?;
            println!("{count}");
        }
        Command::Drain { n } => {
            let max = n.unwrap_or(config.poller.batch_size);
            let batch = buffer
                .poll_batch(max, config.poller.visibility_timeout)
                .await
                .context("poll messages")?;
            for message in &batch {
                println!(
                    "{}\t{}\t{}: {}",
                    message.id, message.enqueued_at, message.payload.sender, message.payload.message
                );
            }
            let ids: Vec<_> = batch.iter().map(|m| m.id).collect();
            buffer
                .acknowledge(&ids)
                .await
                .context("acknowledge drained messages")?;
        }
    }
    Ok(())
}
