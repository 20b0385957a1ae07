//! Device events published by the backend on the event bus.
//!
//! The backend encodes every bus message as a protobuf `Event` envelope. Only a
//! small part of that envelope matters here: test results arrive as a
//! `kpi_event2` whose first slice carries the correlation token in its
//! metadata `uuid` field. The [`pb`] module mirrors just that subset of the
//! schema (unknown fields and the other `event_type` variants are skipped by
//! the decoder), and [`DeviceEvent`] is the typed view the rest of the proxy
//! works with.
//!
//! # Payload rendering
//!
//! The textual payload returned to callers is derived from the slice data:
//! each slice renders as its `title`, followed by `{name=value,...}` with its
//! metrics sorted by name when it has any, then `[key=value,...]` with its
//! metadata context sorted by key when that is non-empty. Slices are joined
//! with `"; "`.
//!
//! ```
//! use ondemand_proxy_core::event::{pb, DeviceEvent, EventKind};
//! use prost::Message;
//!
//! let wire = pb::Event {
//!     header: None,
//!     event_type: Some(pb::event::EventType::KpiEvent2(pb::KpiEvent2 {
//!         r#type: 0,
//!         ts: 0.0,
//!         slice_data: vec![pb::MetricInformation {
//!             metadata: Some(pb::MetricMetaData {
//!                 title: "PASS".to_string(),
//!                 uuid: "c1".to_string(),
//!                 ..Default::default()
//!             }),
//!             metrics: Default::default(),
//!         }],
//!     })),
//! };
//!
//! let event = DeviceEvent::decode(&wire.encode_to_vec()).unwrap();
//! assert_eq!(event.kind, EventKind::TestResult);
//! assert_eq!(event.correlation_token().map(|t| t.as_str()), Some("c1"));
//! assert_eq!(event.payload, "PASS");
//! ```

use crate::token::CorrelationToken;
use prost::Message as _;
use std::collections::HashMap;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The message bytes are not a valid event envelope.
    #[error("Failed to decode event: {0}")]
    Decode(String),
}

/// Protobuf wire model for the subset of the backend event schema the proxy reads.
#[allow(missing_docs)]
pub mod pb {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Event {
        #[prost(message, optional, tag = "1")]
        pub header: Option<EventHeader>,
        #[prost(oneof = "event::EventType", tags = "4")]
        pub event_type: Option<event::EventType>,
    }

    pub mod event {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum EventType {
            #[prost(message, tag = "4")]
            KpiEvent2(super::KpiEvent2),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EventHeader {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(int32, tag = "2")]
        pub category: i32,
        #[prost(int32, tag = "3")]
        pub sub_category: i32,
        #[prost(int32, tag = "4")]
        pub r#type: i32,
        #[prost(string, tag = "5")]
        pub type_version: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KpiEvent2 {
        #[prost(int32, tag = "1")]
        pub r#type: i32,
        #[prost(double, tag = "2")]
        pub ts: f64,
        #[prost(message, repeated, tag = "3")]
        pub slice_data: Vec<MetricInformation>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricInformation {
        #[prost(message, optional, tag = "1")]
        pub metadata: Option<MetricMetaData>,
        #[prost(map = "string, float", tag = "2")]
        pub metrics: HashMap<String, f32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricMetaData {
        #[prost(string, tag = "1")]
        pub title: String,
        #[prost(double, tag = "2")]
        pub ts: f64,
        #[prost(string, tag = "3")]
        pub logical_device_id: String,
        #[prost(string, tag = "4")]
        pub serial_no: String,
        #[prost(string, tag = "5")]
        pub device_id: String,
        #[prost(map = "string, string", tag = "6")]
        pub context: HashMap<String, String>,
        #[prost(string, tag = "7")]
        pub uuid: String,
    }
}

/// Kind of a decoded bus event, as far as correlation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A `kpi_event2` envelope: the kind test-action results are published as.
    TestResult,
    /// Any other envelope (config, alarm, device events, ...).
    Other,
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    /// Envelope id from the event header (empty when absent).
    pub id: String,
    /// Event kind.
    pub kind: EventKind,
    /// Token echoed back by the backend, if this event carries one.
    pub token: Option<CorrelationToken>,
    /// Device the event was raised for, if reported.
    pub device_id: Option<String>,
    /// Textual rendering of the event's result data.
    pub payload: String,
}

impl DeviceEvent {
    /// Decode an event from raw bus bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] if the bytes are not a valid envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let wire = pb::Event::decode(bytes).map_err(|e| EventError::Decode(e.to_string()))?;
        Ok(Self::from_wire(wire))
    }

    /// Build the typed view of a wire envelope.
    #[must_use]
    pub fn from_wire(wire: pb::Event) -> Self {
        let id = wire.header.map(|h| h.id).unwrap_or_default();

        let Some(pb::event::EventType::KpiEvent2(kpi)) = wire.event_type else {
            return Self {
                id,
                kind: EventKind::Other,
                token: None,
                device_id: None,
                payload: String::new(),
            };
        };

        let first = kpi.slice_data.first().and_then(|s| s.metadata.as_ref());
        let token = first
            .map(|m| m.uuid.as_str())
            .filter(|uuid| !uuid.is_empty())
            .map(CorrelationToken::from);
        let device_id = first
            .map(|m| m.device_id.clone())
            .filter(|d| !d.is_empty());

        Self {
            id,
            kind: EventKind::TestResult,
            token,
            device_id,
            payload: render_payload(&kpi.slice_data),
        }
    }

    /// The token a pending request can be matched on.
    ///
    /// Only test-result events are correlatable; every other kind yields `None`
    /// even if it somehow carries a token.
    #[must_use]
    pub fn correlation_token(&self) -> Option<&CorrelationToken> {
        match self.kind {
            EventKind::TestResult => self.token.as_ref(),
            EventKind::Other => None,
        }
    }
}

fn render_payload(slices: &[pb::MetricInformation]) -> String {
    slices
        .iter()
        .map(render_slice)
        .collect::<Vec<_>>()
        .join("; ")
}

fn render_slice(slice: &pb::MetricInformation) -> String {
    let mut out = slice
        .metadata
        .as_ref()
        .map_or_else(String::new, |m| m.title.clone());

    if !slice.metrics.is_empty() {
        out.push('{');
        out.push_str(&render_pairs(&slice.metrics));
        out.push('}');
    }
    if let Some(context) = slice.metadata.as_ref().map(|m| &m.context).filter(|c| !c.is_empty()) {
        out.push('[');
        out.push_str(&render_pairs(context));
        out.push(']');
    }
    out
}

fn render_pairs<V: std::fmt::Display>(pairs: &HashMap<String, V>) -> String {
    let mut sorted: Vec<_> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
