use bon::Builder;

/// Configuration for the RPC handler loops.
#[derive(Debug, Clone, Default, Builder)]
pub struct RpcServerConfig {
    /// Upper bound on handler jobs running at once across all loops of one server.
    /// Unbounded when not set; when the bound is reached, dequeuing pauses until a job finishes.
    pub max_concurrency: Option<usize>,
}
