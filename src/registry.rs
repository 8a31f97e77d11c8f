use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownState;

/// Global counter mixed into connection ids
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Active connection count above which the status task starts warning
pub const HIGH_LOAD_THRESHOLD: usize = 5_000;

/// Generate a new unique connection id
///
/// Lower 48 bits of the current time in nanoseconds followed by the lower
/// 32 bits of a process-wide counter, as lowercase hex.
pub fn new_connection_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:08x}",
        now.as_nanos() & 0xffffffffffff,
        counter & 0xffffffff
    )
}

/// What a tracked socket is used for
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionRole {
    /// Inbound client connection serving plain HTTP requests
    HttpClient,
    /// Outbound connection to an origin for a plain HTTP request
    HttpServer,
    /// Client side of an established CONNECT tunnel
    TunnelClient,
    /// Origin side of an established CONNECT tunnel
    TunnelServer,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionRole::HttpClient => "HTTP-client",
            ConnectionRole::HttpServer => "HTTP-server",
            ConnectionRole::TunnelClient => "HTTPS-tunnel-client",
            ConnectionRole::TunnelServer => "HTTPS-tunnel-server",
        })
    }
}

/// Registry entry for one live socket
///
/// The registry never owns the socket. `close` is observed by whichever task
/// does, and cancelling it makes that task drop the socket.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub role: ConnectionRole,
    pub created_at: SystemTime,
    close: CancellationToken,
}

impl ConnectionRecord {
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
    }
}

/// Table of every live transport connection in the process
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionRecord>>,
    active: watch::Sender<usize>,
    shutdown: Arc<ShutdownState>,
}

impl ConnectionRegistry {
    pub fn new(shutdown: Arc<ShutdownState>) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            connections: Mutex::new(HashMap::new()),
            active,
            shutdown,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, ConnectionRecord>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a connection
    ///
    /// Returns `None` once shutdown has begun; the caller must then drop the
    /// socket straight away instead of serving it.
    pub fn track(self: &Arc<Self>, role: ConnectionRole) -> Option<TrackedConnection> {
        let mut table = self.table();
        if self.shutdown.is_shutting_down() {
            debug!("Refusing {} connection during shutdown", role);
            return None;
        }

        let record = ConnectionRecord {
            id: new_connection_id(),
            role,
            created_at: SystemTime::now(),
            close: CancellationToken::new(),
        };
        let tracked = TrackedConnection {
            id: record.id.clone(),
            role,
            close: record.close.clone(),
            registry: Arc::clone(self),
            untracked: false,
        };

        table.insert(record.id.clone(), record);
        self.active.send_replace(table.len());
        debug!("{} #{} opened, {} active", role, tracked.id, table.len());

        Some(tracked)
    }

    /// Forget a connection; removing an unknown id is a no-op
    pub fn untrack(&self, id: &str) -> bool {
        let mut table = self.table();
        match table.remove(id) {
            Some(record) => {
                self.active.send_replace(table.len());
                debug!(
                    "{} #{} closed after {:?}, {} active",
                    record.role,
                    id,
                    record.age(),
                    table.len()
                );
                true
            }
            None => false,
        }
    }

    /// Force-close every tracked connection and clear the table
    pub fn destroy_all(&self) -> usize {
        let mut table = self.table();
        let count = table.len();
        for (_, record) in table.drain() {
            record.close.cancel();
        }
        self.active.send_replace(0);
        count
    }

    /// Whether shutdown has begun and `track` now refuses new records
    pub fn is_closing(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current records, oldest first
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> = self.table().values().cloned().collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// Resolve once no connections are tracked
    pub async fn drained(&self) {
        let mut active = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let _ = active.wait_for(|count| *count == 0).await;
    }
}

/// RAII handle for a tracked connection
///
/// Dropping it (normal end, error or force-close) untracks the connection,
/// at most once.
pub struct TrackedConnection {
    id: String,
    role: ConnectionRole,
    close: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    untracked: bool,
}

impl TrackedConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Completes when the registry force-closes this connection
    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Manually untrack; later calls and the eventual drop are no-ops
    pub fn untrack(&mut self) {
        if !self.untracked {
            self.registry.untrack(&self.id);
            self.untracked = true;
        }
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.untrack();
    }
}

/// Periodically log the registry size
pub fn spawn_status_monitor(registry: Arc<ConnectionRegistry>, every: Duration) {
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick completes immediately
        interval.tick().await;
        let mut last_active = 0;

        loop {
            interval.tick().await;
            let active = registry.len();

            if active != last_active {
                info!("Active connections: {}", active);
            }

            match active {
                0..=HIGH_LOAD_THRESHOLD => {}
                n if n <= HIGH_LOAD_THRESHOLD * 3 => {
                    warn!("High connection load: {} active", n);
                }
                n => {
                    error!("CRITICAL connection load: {} active", n);
                    if let Some(oldest) = registry.snapshot().first() {
                        error!(
                            "Oldest connection: {} #{} open for {:?}",
                            oldest.role,
                            oldest.id,
                            oldest.age()
                        );
                    }
                }
            }

            last_active = active;
        }
    });
}
