//! # Ondemand Proxy Core
//!
//! Core traits and types shared by every crate of the on-demand test proxy.
//!
//! The proxy turns one asynchronous backend workflow into a synchronous call:
//! a diagnostic test action is started on a managed device, the backend accepts
//! it, and the actual result shows up later as an event on a shared bus. The
//! pieces that make this possible live here:
//!
//! - [`token::CorrelationToken`]: the unique value threaded through the backend
//!   call and echoed back inside the completion event
//! - [`event::DeviceEvent`]: the typed view of a bus message, decoded from the
//!   backend's protobuf envelope
//! - [`event_bus::EventBus`]: publish/subscribe over one topic
//! - [`action::ActionClient`]: the single backend action the proxy invokes
//!
//! ## Flow
//!
//! ```text
//! RPC call ──► Request Handler ──► ActionClient (start test, token T)
//!                    │                      │
//!                    │ waits on T           └─► backend publishes Event{uuid = T}
//!                    ▼                                      │
//!            Correlation Bridge ◄── EventBus stream ◄───────┘
//! ```

pub mod action;
pub mod event;
pub mod event_bus;
pub mod token;

pub use action::{ActionClient, ActionOutcome, BackendError, PENDING_STATUS};
pub use event::{DeviceEvent, EventError, EventKind};
pub use event_bus::{EventBus, EventBusError, EventStream};
pub use token::CorrelationToken;
