//! Typed gateways built on the RPC bus.

pub mod login;
pub mod monitoring;

pub use login::{LoginClient, LoginError, LoginService, serve_login};
pub use monitoring::{Metrics, MetricsPublisher, watch_metrics};
