use thiserror::Error;

/// The stream set's actor has stopped; no command can be applied anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream set is shut down")]
pub struct StreamSetClosed;
