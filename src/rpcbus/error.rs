use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::codec::CodecError;
use crate::rpcbus::frame::FrameError;
use crate::topic::Topic;

/// Errors that can occur in the broker-mediated RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection or pool failure, including a failed liveness ping.
    #[error("broker transport error")]
    Transport(#[source] BrokerError),

    /// Failed to publish or push a payload.
    #[error("failed to publish on '{topic}'")]
    Publish {
        topic: Topic,
        #[source]
        source: BrokerError,
    },

    /// Failed to pop from a work queue.
    #[error("failed to dequeue from '{topic}'")]
    Dequeue {
        topic: Topic,
        #[source]
        source: BrokerError,
    },

    /// Failed to encode or decode a payload body.
    #[error("codec error")]
    Codec(#[from] CodecError),

    /// A payload did not carry a correlation id.
    #[error("malformed frame")]
    Frame(#[from] FrameError),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// No reply arrived before the request deadline.
    #[error("no reply after {0:?}")]
    Timeout(Duration),

    /// The remote handler returned an error.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// The subscription task panicked.
    #[error("subscription task panicked")]
    SubscriptionPanicked,

    /// The reply subscription ended before any reply arrived.
    #[error("reply subscription closed")]
    ConnectionClosed,
}
