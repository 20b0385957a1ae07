//! # Ondemand Proxy
//!
//! gRPC proxy that runs a diagnostic test on a device through the backend
//! management service and returns the result the backend later publishes on
//! the event bus.
//!
//! ```text
//! OmciTest(OnuID) → RequestHandler ─ register(token) ─→ CorrelationBridge
//!                        │                                     ↑
//!                        └─ StartOmciTestAction(id, token) ─→ backend ─→ event bus
//! ```
//!
//! - [`config`]: YAML file, flags and defaults merged into one [`ProxyConfig`]
//! - [`backend`]: tonic client for the backend's test action
//! - [`handler`]: the per-request state machine
//! - [`server`]: the `NemService` surface
//! - [`error`]: error types and gRPC status mapping

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod proto;
pub mod server;

pub use backend::VolthaActionClient;
pub use config::{Cli, ConfigError, ProxyConfig};
pub use error::{HandlerError, StartupError};
pub use handler::{FAILURE, RequestHandler};
pub use server::OnDemandService;
