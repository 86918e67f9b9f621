//! Daemon lifecycle: bind, serve, idle watch, shutdown

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sealkeep_core::{Config, Paths, Registry, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::ControlChannel;
use crate::handler::Handler;
use crate::session::Session;

/// Run the daemon until `shutdown` completes. The session is logged out
/// (and its keys zeroed) before returning.
pub async fn run(
    paths: &Paths,
    config: &Config,
    registry: Arc<dyn Registry>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let channel = ControlChannel::bind(paths)?;

    let session = Arc::new(Session::new(registry.clone()));
    let handler = Arc::new(Handler::new(registry, session.clone()));
    let idle = spawn_idle_watch(session.clone(), config.idle_timeout(), config.idle_check_interval());

    info!(
        "sealkeepd {} started (pid {}, idle timeout {}s)",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        config.idle_timeout_secs
    );

    let result = channel.serve(handler, shutdown).await;

    idle.abort();
    session.logout().await;
    info!("sealkeepd stopped");
    result
}

/// The one background task: lock the session once it has been idle for
/// `timeout`, checking every `interval`.
pub fn spawn_idle_watch(session: Arc<Session>, timeout: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if session.lock_if_idle(timeout) {
                info!("Session locked after {} idle", sealkeep_core::format::duration(timeout));
            }
        }
    })
}
