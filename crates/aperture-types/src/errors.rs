use thiserror::Error;

pub type Result<T, E = ApertureError> = std::result::Result<T, E>;

/// Unified error type covering common failure scenarios across subsystems.
#[derive(Debug, Error)]
pub enum ApertureError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("link error: {0}")]
    Link(String),
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
