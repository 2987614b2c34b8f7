//! Server side of the RPC bus: handler loops over broker work queues.

mod config;
mod rpc_server;

pub use config::RpcServerConfig;
pub use rpc_server::RpcServer;
