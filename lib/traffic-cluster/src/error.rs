use std::fmt;
use thiserror::Error;
use traffic_core::CoreError;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Which throttle turned a call away
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdmissionKind {
    /// Consumer-side requests per second
    Rate,
    /// Provider-side in-flight requests
    Concurrency,
}

impl AdmissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionKind::Rate => "rate",
            AdmissionKind::Concurrency => "concurrency",
        }
    }
}

impl fmt::Display for AdmissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("No available provider for {service}")]
    NoAvailableProvider { service: String },

    #[error("Admission rejected by {kind} limit on {name} (max {max})")]
    AdmissionRejected {
        kind: AdmissionKind,
        name: String,
        max: i64,
    },

    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ClusterError {
    /// Admission denials clear on their own; a missing provider does not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::AdmissionRejected { .. } | ClusterError::ConnectionFailed { .. }
        )
    }
}
