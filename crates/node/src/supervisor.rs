//! Task supervision for the ratewatch daemon.
//!
//! A small supervision layer over tokio-util's `TaskTracker` and
//! `CancellationToken`. Every long-running subsystem (scrape pool, query
//! listeners, endpoint steering) registers here; shutdown fans the stop
//! signal out to all of them and then waits for the drain, bounded by a
//! timeout.
//!
//! # Shutdown order
//!
//! 1. Revoke the steering endpoint so consumers stop arriving
//! 2. Close the scrape queue and drain in-flight scrapes
//! 3. Stop the serving and metrics listeners
//! 4. Exit

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// How long shutdown waits for in-flight scrapes and open connections
/// before giving up on stragglers.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result type for supervised subsystems.
pub type SupervisedResult = Result<(), anyhow::Error>;

/// Owns the lifecycle of the daemon's long-running subsystems.
#[derive(Clone)]
pub struct Supervisor {
    /// One tracked task per subsystem.
    subsystems: TaskTracker,
    /// Fans the stop signal out to every subsystem.
    token: CancellationToken,
    /// Set once the drain begins. Subsystem errors after this point are the
    /// expected way listeners and the steerer wind down, not failures.
    draining: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create a supervisor with the default drain timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Create a supervisor with a custom drain timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            subsystems: TaskTracker::new(),
            token: CancellationToken::new(),
            draining: Arc::new(AtomicBool::new(false)),
            drain_timeout: timeout,
        }
    }

    /// The token subsystems watch for the stop signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Registers a subsystem with the supervisor.
    ///
    /// `task` receives the supervisor's cancellation token and must wind
    /// down promptly once it fires. Its outcome is logged under
    /// `subsystem`; a failure outside of the drain never takes the rest of
    /// the daemon down.
    pub fn spawn_cancellable<F, Fut>(&self, subsystem: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = SupervisedResult> + Send + 'static,
    {
        let token = self.token.clone();
        let draining = self.draining.clone();

        self.subsystems.spawn(async move {
            match task(token).await {
                Ok(()) => info!(subsystem, "subsystem stopped"),
                Err(e) if draining.load(Ordering::SeqCst) => {
                    info!(subsystem, error = %e, "subsystem wound down while draining");
                }
                Err(e) => {
                    // The daemon keeps running on whatever subsystems
                    // remain; a dead scraper only means rates go stale.
                    error!(subsystem, error = %e, "subsystem failed");
                }
            }
        });
    }

    /// Stops every subsystem and waits for the drain.
    ///
    /// Signals cancellation, refuses new subsystem registrations, and waits
    /// up to the drain timeout for in-flight work to finish. Repeated calls
    /// return immediately.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.draining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("stopping subsystems and draining in-flight scrapes");
        self.subsystems.close();
        self.token.cancel();

        match tokio::time::timeout(self.drain_timeout, self.subsystems.wait()).await {
            Ok(()) => {
                info!("all subsystems drained");
                Ok(())
            }
            Err(_) => {
                error!(
                    timeout_secs = self.drain_timeout.as_secs(),
                    "subsystems still running past the drain timeout"
                );
                Err(ShutdownError::DrainTimeout)
            }
        }
    }
}

/// Errors that can occur during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownError {
    /// One or more subsystems did not drain within the timeout.
    DrainTimeout,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::DrainTimeout => {
                write!(f, "subsystems did not drain within the shutdown timeout")
            }
        }
    }
}

impl std::error::Error for ShutdownError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    #[tokio::test]
    async fn spawned_subsystems_complete_before_shutdown_returns() {
        let supervisor = Supervisor::with_timeout(Duration::from_secs(5));
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            supervisor.spawn_cancellable("test-subsystem", move |_token| async move {
                sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        sleep(Duration::from_millis(10)).await;
        supervisor.shutdown().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_reaches_spawned_subsystems() {
        let supervisor = Supervisor::new();
        let cancelled = Arc::new(AtomicBool::new(false));

        let observed = cancelled.clone();
        supervisor.spawn_cancellable("cancellable-subsystem", move |token| async move {
            tokio::select! {
                _ = token.cancelled() => {
                    observed.store(true, Ordering::SeqCst);
                }
                _ = sleep(Duration::from_secs(60)) => {}
            }
            Ok(())
        });

        sleep(Duration::from_millis(20)).await;
        supervisor.shutdown().await.unwrap();
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_subsystems() {
        let supervisor = Supervisor::with_timeout(Duration::from_millis(50));
        supervisor.spawn_cancellable("stuck-subsystem", |_token| async move {
            std::future::pending::<()>().await;
            Ok(())
        });

        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            supervisor.shutdown().await,
            Err(ShutdownError::DrainTimeout)
        );
    }

    #[tokio::test]
    async fn repeated_shutdown_returns_immediately() {
        let supervisor = Supervisor::new();
        supervisor.shutdown().await.unwrap();
        // The drain already ran; a second call must not wait or fail.
        supervisor.shutdown().await.unwrap();
    }
}
