//! Long-running tasks that run alongside the realtime channel.

use tokio::sync::watch;

pub mod poller;

/// Resolves once `stop` has been set to `true`.
///
/// If every sender is gone no stop can ever be requested, so this never resolves.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
