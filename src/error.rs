use thiserror::Error;

/// Error type handed across collaborator boundaries (connection factory,
/// discovery stream, connection close).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum LoadBalancerError {
    #[error("No hosts available for {target}")]
    NoAvailableHost { target: String },

    #[error("No active hosts for {target}: all {hosts} known hosts are expired or unhealthy")]
    NoActiveHost { target: String, hosts: usize },

    #[error("Connection rejected for {target}: {reason}")]
    ConnectionRejected {
        target: String,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: BoxError,
    },

    #[error("Load balancer for {0} is closed")]
    Closed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to close {failed} of {total} connections")]
    CloseFailed { failed: usize, total: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_yaml::Error),
}

impl LoadBalancerError {
    /// True when no host could serve the selection. Retrying is left to the caller.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LoadBalancerError::NoAvailableHost { .. }
                | LoadBalancerError::NoActiveHost { .. }
                | LoadBalancerError::ConnectionRejected { .. }
        )
    }

    pub(crate) fn rejected(target: &str, reason: impl Into<String>) -> Self {
        LoadBalancerError::ConnectionRejected {
            target: target.to_string(),
            reason: reason.into(),
            source: None,
        }
    }
}

// Define our custom Result type
pub type Result<T> = core::result::Result<T, LoadBalancerError>;
