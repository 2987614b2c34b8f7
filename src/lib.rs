pub mod broker;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod logging;
pub mod rpcbus;
pub mod services;
pub mod state_machine;
pub mod stream_set;
pub mod topic;

pub use broker::{BrokerError, Connection, Connector, MemoryBroker, Pool, PoolConfig};
pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{BusConfig, ConfigError};
pub use correlation::CorrelationId;
pub use rpcbus::{Request, Response, RpcClient, RpcError, RpcServer};
pub use stream_set::{StreamSet, StreamSetConfig};
pub use topic::{Topic, topics};

/// Build a client and a server for one process.
///
/// Each side gets its own pool with the configured limits, so handler loops blocked on their
/// work queues never starve outgoing requests of connections.
pub fn connect<C>(connector: C, config: &BusConfig) -> (RpcClient<C>, RpcServer<C>)
where
    C: Connector + Clone,
{
    let client_pool = Pool::new(connector.clone(), config.pool.clone());
    let server_pool = Pool::new(connector, config.pool.clone());

    (
        RpcClient::new(client_pool, config.client.clone()),
        RpcServer::new(server_pool, config.server.clone()),
    )
}
