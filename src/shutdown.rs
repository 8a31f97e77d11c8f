use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::ConnectionRegistry;

/// Default wait before lingering connections are force-closed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Default absolute bound on the whole shutdown
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide shutdown flag, flips from false to true exactly once
#[derive(Debug, Default)]
pub struct ShutdownState {
    shutting_down: AtomicBool,
    stop_accepting: CancellationToken,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter shutdown; returns `false` if it had already begun
    pub fn begin(&self) -> bool {
        let first = self
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.stop_accepting.cancel();
        }
        first
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Completes once the listener should stop accepting
    pub async fn accepting_stopped(&self) {
        self.stop_accepting.cancelled().await
    }
}

/// Graceful-then-forced termination
///
/// After [`initiate`](Self::initiate) the listener stops accepting, a grace
/// timer force-closes whatever is still tracked, and an independent hard timer
/// closes everything again and releases [`wait`](Self::wait).
pub struct ShutdownCoordinator {
    state: Arc<ShutdownState>,
    registry: Arc<ConnectionRegistry>,
    grace_period: Duration,
    hard_timeout: Duration,
    deadline: CancellationToken,
    runtime: Handle,
}

impl ShutdownCoordinator {
    /// Must be called from inside the tokio runtime
    pub fn new(
        state: Arc<ShutdownState>,
        registry: Arc<ConnectionRegistry>,
        grace_period: Duration,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            state,
            registry,
            grace_period,
            hard_timeout,
            deadline: CancellationToken::new(),
            runtime: Handle::current(),
        }
    }

    /// Start shutting down; later calls are no-ops and return `false`
    ///
    /// Synchronous so it can run from a panic hook on any thread.
    pub fn initiate(&self, reason: &str) -> bool {
        if !self.state.begin() {
            debug!("Shutdown already in progress, ignoring {}", reason);
            return false;
        }

        info!(
            "Shutting down ({}), {} connections open",
            reason,
            self.registry.len()
        );

        let registry = Arc::clone(&self.registry);
        let grace_period = self.grace_period;
        self.runtime.spawn(async move {
            tokio::time::sleep(grace_period).await;
            let remaining = registry.len();
            if remaining > 0 {
                warn!(
                    "Grace period of {:?} elapsed, force-closing {} connections",
                    grace_period, remaining
                );
                registry.destroy_all();
            }
        });

        let registry = Arc::clone(&self.registry);
        let deadline = self.deadline.clone();
        let hard_timeout = self.hard_timeout;
        self.runtime.spawn(async move {
            tokio::time::sleep(hard_timeout).await;
            let destroyed = registry.destroy_all();
            if destroyed > 0 {
                warn!(
                    "Hard shutdown deadline of {:?} reached, destroyed {} connections",
                    hard_timeout, destroyed
                );
            }
            deadline.cancel();
        });

        true
    }

    /// Wait until shutdown has begun and then either every connection closed
    /// or the hard deadline passed
    pub async fn wait(&self) {
        self.state.accepting_stopped().await;

        tokio::select! {
            _ = self.registry.drained() => {
                info!("All connections closed");
            }
            _ = self.deadline.cancelled() => {
                warn!("Forced shutdown at hard deadline");
            }
        }
    }

    /// Treat any panic as fatal: report it, then shut down gracefully
    pub fn install_panic_hook(self: &Arc<Self>) {
        let previous = std::panic::take_hook();
        let coordinator = Arc::clone(self);
        std::panic::set_hook(Box::new(move |panic_info| {
            error!("Fatal error: {}", panic_info);
            previous(panic_info);
            coordinator.initiate("fatal error");
        }));
    }
}

/// Resolve on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received interrupt signal"),
        () = terminate => info!("Received SIGTERM"),
    }
}
