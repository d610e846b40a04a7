use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("Coordination store error: {0}")]
    CoordinationStore(String),
}

impl CoreError {
    pub(crate) fn invalid_endpoint(input: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidEndpoint {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
