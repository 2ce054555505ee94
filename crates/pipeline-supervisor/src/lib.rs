// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod health;
mod http;
mod telemetry;

pub use health::HealthChecker;
pub use http::{build_app, AppState};
pub use telemetry::{init_tracing, TracingGuard};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pipeline_error::{ErrorCode, PipelineError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One long-lived task registered with a [`Supervisor`]: a name for logging
/// plus the `JoinHandle` of the already-spawned task.
struct Supervised {
    name: String,
    handle: JoinHandle<Result<(), PipelineError>>,
}

/// Fans in a stage service's long-running tasks (data-topic consumer,
/// control-event consumer, optional background sampler, HTTP server) behind
/// a shared [`CancellationToken`].
///
/// The first task to return an error, or to panic, cancels the token so
/// every other task observes cancellation at its next I/O or iteration
/// point. [`Supervisor::join`] waits up to a configured shutdown timeout for
/// every task to drain, then returns the first error encountered (if any).
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<Supervised>,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Build a supervisor sharing `cancel` with every task it spawns.
    pub fn new(cancel: CancellationToken, shutdown_timeout: Duration) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
            shutdown_timeout,
        }
    }

    /// The cancellation token every spawned task should select against.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn `future` as a named, supervised task. A task that returns
    /// `Err` or panics cancels the shared token immediately so siblings
    /// unwind promptly instead of continuing to process traffic against a
    /// half-shutdown service.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = future.await;
            if let Err(ref e) = result {
                error!(task = %task_name, error = %e, "supervised task failed, cancelling peers");
                cancel.cancel();
            }
            result
        });
        self.tasks.push(Supervised { name, handle });
    }

    /// Spawn a task that runs until `cancel` fires and never itself
    /// produces a result worth propagating (a background sampler, a
    /// periodic reloader already covered by its own consumer loop).
    pub fn spawn_fire_and_forget<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            future.await;
            Ok(())
        });
    }

    /// Wait for every task to finish, returning the first error observed.
    /// Once the shared token is cancelled (by a failing task or the
    /// caller's own shutdown signal), tasks are given `shutdown_timeout`
    /// to drain before this returns anyway, leaving any still-running
    /// handle detached — a message whose handler is mid-flight at that
    /// point is not committed and will be redelivered, per the pipeline's
    /// at-least-once contract.
    pub async fn join(self) -> Result<(), PipelineError> {
        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);

        let mut first_error = None;
        let mut remaining: Vec<Supervised> = self.tasks;

        loop {
            if remaining.is_empty() {
                break;
            }

            let waits = remaining.iter_mut().map(|t| &mut t.handle);
            let (result, index, _) = tokio::select! {
                out = futures::future::select_all(waits) => out,
                _ = &mut deadline, if self.cancel.is_cancelled() => {
                    warn!(
                        remaining = remaining.len(),
                        "shutdown timeout elapsed with tasks still running, leaving them detached"
                    );
                    break;
                }
            };

            let finished = remaining.remove(index);
            match result {
                Ok(Ok(())) => info!(task = %finished.name, "supervised task exited cleanly"),
                Ok(Err(e)) => {
                    error!(task = %finished.name, error = %e, "supervised task exited with error");
                    first_error.get_or_insert(e);
                    self.cancel.cancel();
                }
                Err(join_error) => {
                    let e = PipelineError::new(
                        ErrorCode::Internal,
                        format!("task '{}' panicked: {join_error}", finished.name),
                    );
                    error!(task = %finished.name, error = %e, "supervised task panicked");
                    first_error.get_or_insert(e);
                    self.cancel.cancel();
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Register the standard signal-driven shutdown trigger: cancels `cancel`
/// on SIGINT/SIGTERM (or just Ctrl+C on platforms without `signal::unix`).
pub fn spawn_signal_shutdown(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, cancelling supervised tasks");
        cancel.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Convenience: spawn the shared `/health` + `/metrics` HTTP server as a
/// supervised task, bound to `bind_addr`.
pub fn spawn_http_server(
    supervisor: &mut Supervisor,
    bind_addr: String,
    state: Arc<AppState>,
) {
    let cancel = supervisor.cancellation_token();
    supervisor.spawn("http", async move {
        let app = build_app(state);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.map_err(|e| {
            PipelineError::new(ErrorCode::Internal, format!("failed to bind {bind_addr}: {e}"))
        })?;
        info!(bind_addr = %bind_addr, "health/metrics server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| PipelineError::new(ErrorCode::Internal, format!("http server error: {e}")))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn all_tasks_succeeding_joins_cleanly() {
        let cancel = CancellationToken::new();
        let mut supervisor = Supervisor::new(cancel, Duration::from_secs(1));
        supervisor.spawn("a", async { Ok(()) });
        supervisor.spawn("b", async { Ok(()) });
        assert!(supervisor.join().await.is_ok());
    }

    #[tokio::test]
    async fn one_failing_task_cancels_and_surfaces_error() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut supervisor = Supervisor::new(cancel, Duration::from_secs(5));
        supervisor.spawn("failing", async {
            Err(PipelineError::new(ErrorCode::Internal, "boom"))
        });
        supervisor.spawn("long-runner", async move {
            token.cancelled().await;
            Ok(())
        });
        let result = supervisor.join().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fire_and_forget_task_runs_to_completion() {
        let cancel = CancellationToken::new();
        let mut supervisor = Supervisor::new(cancel, Duration::from_secs(1));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        supervisor.spawn_fire_and_forget("sampler", async move {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        supervisor.join().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_timeout_detaches_stuck_tasks() {
        let cancel = CancellationToken::new();
        let mut supervisor = Supervisor::new(cancel.clone(), Duration::from_millis(50));
        supervisor.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.join()).await;
        assert!(result.is_ok(), "join should return once the shutdown timeout elapses");
    }
}
