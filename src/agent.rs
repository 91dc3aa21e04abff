use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::collector::CollectorTable;
use crate::config::Config;
use crate::error::AgentError;
use crate::manager::Manager;
use crate::queue::OutboundQueue;
use crate::sender::Sender;
use crate::status;

/// Wire the pipeline together and run until a shutdown signal arrives.
///
/// Task layout: one manager (tick loop plus child lifecycle), reader
/// tasks spawned per child by the manager, one sender, and the optional
/// status server. SIGINT/SIGTERM shut everything down within the
/// configured timeout; SIGHUP restarts the collector fleet in place.
pub async fn run(cfg: Config) -> Result<(), AgentError> {
    cfg.validate()?;
    let cfg = Arc::new(cfg);

    let table = CollectorTable::new();
    let (queue, rx) = OutboundQueue::new(cfg.max_queue_depth);
    let cancel = CancellationToken::new();
    let restart = Arc::new(Notify::new());

    let sender = Sender::new(&cfg, rx)?;
    let sender_task = tokio::spawn(sender.run(cancel.clone()));

    let manager = Manager::new(cfg.clone(), table.clone(), queue.clone(), restart.clone());
    let manager_task = tokio::spawn(manager.run(cancel.clone()));

    let status_task = cfg.status_listen.clone().map(|addr| {
        let table = table.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = status::run(addr, table, cancel).await {
                tracing::error!(%err, "status server failed");
            }
        })
    });

    wait_for_shutdown(restart).await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    // The manager owns the slow part of shutdown (kill escalation); it
    // bounds itself with shutdown_timeout. The extra slack covers the
    // sender's final flush.
    let teardown = async {
        let _ = manager_task.await;
        let _ = sender_task.await;
        if let Some(task) = status_task {
            let _ = task.await;
        }
    };
    let limit = Duration::from_secs(cfg.shutdown_timeout + 5);
    if tokio::time::timeout(limit, teardown).await.is_err() {
        tracing::warn!("shutdown timed out, exiting anyway");
    }

    if queue.dropped() > 0 {
        tracing::info!(total_dropped = queue.dropped(), "samples dropped to overflow this run");
    }
    Ok(())
}

/// Block until SIGINT or SIGTERM. SIGHUP does not return; it pokes the
/// manager to restart all collectors.
async fn wait_for_shutdown(restart: Arc<Notify>) -> Result<(), AgentError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(());
            }
            _ = term.recv() => return Ok(()),
            _ = hup.recv() => {
                tracing::info!("SIGHUP received, restarting collectors");
                restart.notify_one();
            }
        }
    }
}
