//! # Ondemand Proxy Testing
//!
//! Testing utilities and helpers for the on-demand test proxy.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: broadcast-channel event bus with the same decode path
//!   as the Kafka client
//! - [`MockActionClient`]: scripted backend action client
//! - [`events`]: builders for encoded bus messages
//! - [`init_test_tracing`]: opt-in log output for test runs
//!
//! ## Example
//!
//! ```
//! use ondemand_proxy_core::event_bus::EventBus;
//! use ondemand_proxy_testing::{events, InMemoryEventBus};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryEventBus::new();
//! let mut stream = bus.subscribe("voltha.events").await?;
//!
//! bus.publish("voltha.events", &events::test_result("c1", "PASS")).await?;
//!
//! let event = stream.next().await.unwrap()?;
//! assert_eq!(event.payload, "PASS");
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod mocks;

pub use mocks::{InMemoryEventBus, MockActionClient};

/// Install a `fmt` subscriber honouring `RUST_LOG`, once per test binary.
///
/// Safe to call from every test; only the first call has an effect.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
