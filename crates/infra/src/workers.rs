//! Background task handles.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle to control and join a background task.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops
/// the task at its next shutdown check.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` with a shutdown signal it must watch.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(body(shutdown_rx));
        tracing::debug!(worker = name, "worker started");
        Self {
            name,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Run `tick` every `period` until shut down. The first tick runs
    /// immediately.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |mut shutdown| async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = interval.tick() => tick().await,
                }
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                tracing::warn!(worker = self.name, error = ?err, "worker ended abnormally");
            }
        }
    }
}
