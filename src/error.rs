use std::io;

/// Error type for outbound proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {0:?} without activity")]
    Timeout(std::time::Duration),

    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    #[error("proxy is shutting down")]
    ShuttingDown,

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Whether this failure happened while resolving the target host.
    ///
    /// Only these failures are eligible for the dual-stack fallback dial.
    pub fn is_resolution(&self) -> bool {
        matches!(self, ProxyError::Resolution { .. })
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
