//! Client side of the RPC bus.
//!
//! # Example
//!
//! ```ignore
//! use boxy_bus::rpcbus::client::{Request, RpcClient, RpcClientConfig};
//!
//! let config = RpcClientConfig::builder()
//!     .timeout(Duration::from_secs(5))
//!     .build();
//! let client = RpcClient::new(pool, config);
//!
//! let request = Request::builder()
//!     .topic("echo")
//!     .params("ping")
//!     .cancel(shutdown.child_token())
//!     .build();
//! let echoed: String = client.request(request).await?.decode()?;
//! ```

mod config;
mod request;
mod response;
mod rpc_client;

pub use config::RpcClientConfig;
pub use request::Request;
pub use response::Response;
pub use rpc_client::RpcClient;
