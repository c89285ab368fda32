use coordination::CoordinationError;
use thiserror::Error;

/// Errors surfaced by the discovery lifecycle.
///
/// Only startup can return these to the caller; steady-state failures are
/// logged and retried.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A required option is absent or empty.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// An option is present but unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("discovery already started")]
    AlreadyStarted,

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
