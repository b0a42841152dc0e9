use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the long running tasks of one process and stops them together.
pub struct Tasks {
    pub tasks: Vec<JoinHandle<Result<()>>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawns `task` with a child of the shared cancellation token.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fut = task(self.cancellation_token.child_token());
        self.spawn_fallible(name, move |_| async move {
            fut.await;
            Ok(())
        });
    }

    /// Like [`Tasks::spawn`]; an error returned by `task` ends
    /// [`Tasks::wait_for_completion`] with that error.
    pub fn spawn_fallible<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let fut = task(self.cancellation_token.child_token());
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting {name} task");
            let result = fut.await;
            tracing::info!("{name} task completed");
            result
        }));
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }

        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.shutdown().await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, remaining) = result;
                drop(remaining);
                // the finished handle must not be polled again
                drop(self.tasks.swap_remove(index));
                self.shutdown().await;
                match result {
                    Err(e) => {
                        tracing::error!("Task completed with error: {e}");
                        return Err(e.into());
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Task failed: {e:?}");
                        return Err(e);
                    }
                    Ok(Ok(())) => tracing::warn!("Task completed unexpectedly"),
                }
            }
        }

        Ok(())
    }

    async fn shutdown(&mut self) {
        self.cancellation_token.cancel();
        tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            for task in &mut self.tasks {
                match task.await {
                    Err(e) => tracing::error!("Task failed during shutdown: {e}"),
                    Ok(Err(e)) => tracing::error!("Task failed during shutdown: {e:?}"),
                    Ok(Ok(())) => {}
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        });
    }
}
