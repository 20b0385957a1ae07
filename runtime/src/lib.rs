//! # Ondemand Proxy Runtime
//!
//! Runtime pieces behind the on-demand test proxy.
//!
//! ## Core Components
//!
//! - **[`CorrelationBridge`]**: one long-lived bus subscription that wakes the
//!   request waiting for each completion event
//! - **[`Registration`]**: a request's claim on its correlation token, cleaned
//!   up on drop
//! - **[`retry`]**: bounded exponential backoff for transient backend failures
//! - **[`metrics`]**: Prometheus counters and the scrape endpoint
//!
//! ## Example
//!
//! ```
//! use ondemand_proxy_core::{CorrelationToken, EventBus};
//! use ondemand_proxy_runtime::{BridgeConfig, CorrelationBridge};
//! use ondemand_proxy_testing::{InMemoryEventBus, events};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(InMemoryEventBus::new());
//! let bridge = CorrelationBridge::start(bus.clone(), BridgeConfig::default()).await?;
//!
//! let registration = bridge.register(CorrelationToken::from("c1"))?;
//! bus.publish("voltha.events", &events::test_result("c1", "PASS")).await?;
//!
//! let event = registration.wait(Duration::from_secs(5)).await?;
//! assert_eq!(event.payload, "PASS");
//! # Ok(())
//! # }
//! ```

/// Correlation bridge and per-request registrations
pub mod correlation;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

mod pending;

pub use correlation::{BridgeConfig, BridgeError, CorrelationBridge, Registration, WaitError};
pub use retry::RetryPolicy;
