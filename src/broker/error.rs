use std::time::Duration;

/// Errors raised by a broker connection or the connection pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The connection was closed or severed by the broker.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// A new connection could not be established.
    #[error("failed to dial broker: {0}")]
    Dial(String),

    /// The broker refused a single command. The connection stays usable.
    #[error("broker rejected the command: {0}")]
    Rejected(String),

    /// No connection became available within the pool's wait timeout.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),
}
