//! # rpcbus
//!
//! Correlated request/response over a broker that only offers pub/sub topics and work queues.
//!
//! ## Client side
//!
//! [`RpcClient::request`] allocates a correlation id, subscribes to the reply topic named after
//! it and, once the broker confirmed that subscription, pushes the framed request on the target
//! work queue. The first reply resolves the call.
//!
//! ```ignore
//! use boxy_bus::rpcbus::{Request, RpcClient, RpcClientConfig};
//!
//! let client = RpcClient::new(pool.clone(), RpcClientConfig::default());
//! let echoed: String = client.request(Request::new("echo", "ping")).await?.decode()?;
//! ```
//!
//! ## Server side
//!
//! [`RpcServer::handle`] pops framed requests from a work queue, decodes them, runs the handler
//! on its own task and publishes the [`Reply`] on the requester's reply topic.
//!
//! ```ignore
//! use boxy_bus::rpcbus::{RpcServer, RpcServerConfig};
//!
//! let server = RpcServer::new(pool, RpcServerConfig::default());
//! server
//!     .handle("echo", |_id, params: String| async move { Ok::<_, Infallible>(params) })
//!     .await?;
//! ```
//!
//! ## Wire format
//!
//! Requests and replies share one layout: `correlation id (16 bytes) || body`. The request
//! travels on the operation's work queue, the reply on the topic whose name is the correlation
//! id in its canonical string form.

mod error;
mod frame;
mod reply;

pub mod client;
pub mod server;
pub mod subscription;


pub use error::RpcError;
pub use frame::{Frame, FrameError};
pub use reply::Reply;

pub use client::{Request, Response, RpcClient, RpcClientConfig};
pub use server::{RpcServer, RpcServerConfig};
pub use subscription::{Subscription, SubscriptionHandle};
