use std::time::Duration;

use bon::Builder;

/// Configuration for the RPC client.
#[derive(Debug, Clone, Builder)]
pub struct RpcClientConfig {
    /// Interval between liveness pings on a reply or stream subscription.
    #[builder(default = Duration::from_secs(60))]
    pub ping_interval: Duration,

    /// Deadline for a single request, measured from the call until the reply arrives.
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
