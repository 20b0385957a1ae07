//! Builders for encoded bus messages.
//!
//! Everything here returns the raw bytes a broker would carry, so tests drive
//! the real decode path.

use ondemand_proxy_core::event::pb;
use prost::Message;
use std::collections::HashMap;

/// A test-result event carrying `token`, whose payload renders as `title`.
#[must_use]
pub fn test_result(token: &str, title: &str) -> Vec<u8> {
    test_result_with_metrics(token, title, &[])
}

/// A test-result event with metrics attached to its single slice.
#[must_use]
pub fn test_result_with_metrics(token: &str, title: &str, metrics: &[(&str, f32)]) -> Vec<u8> {
    test_result_envelope(token, title, metrics).encode_to_vec()
}

/// The wire envelope behind [`test_result_with_metrics`].
#[must_use]
pub fn test_result_envelope(token: &str, title: &str, metrics: &[(&str, f32)]) -> pb::Event {
    pb::Event {
        header: Some(pb::EventHeader {
            id: format!("evt-{token}"),
            type_version: "0.1".to_string(),
            ..Default::default()
        }),
        event_type: Some(pb::event::EventType::KpiEvent2(pb::KpiEvent2 {
            r#type: 0,
            ts: 0.0,
            slice_data: vec![pb::MetricInformation {
                metadata: Some(pb::MetricMetaData {
                    title: title.to_string(),
                    uuid: token.to_string(),
                    ..Default::default()
                }),
                metrics: metrics
                    .iter()
                    .map(|(name, value)| ((*name).to_string(), *value))
                    .collect::<HashMap<_, _>>(),
            }],
        })),
    }
}

/// A test-result event whose slice data is empty (no token, no payload).
#[must_use]
pub fn test_result_without_slices() -> Vec<u8> {
    pb::Event {
        header: Some(pb::EventHeader::default()),
        event_type: Some(pb::event::EventType::KpiEvent2(pb::KpiEvent2::default())),
    }
    .encode_to_vec()
}

/// An event of a kind the bridge never correlates on.
#[must_use]
pub fn unrelated(id: &str) -> Vec<u8> {
    pb::Event {
        header: Some(pb::EventHeader {
            id: id.to_string(),
            category: 2,
            ..Default::default()
        }),
        event_type: None,
    }
    .encode_to_vec()
}

/// Bytes that are not a valid envelope.
#[must_use]
pub fn garbage() -> Vec<u8> {
    vec![0x0a, 0x64, 0x01, 0xff]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ondemand_proxy_core::{CorrelationToken, DeviceEvent, EventKind};

    #[test]
    fn test_result_decodes_with_token() {
        let event = DeviceEvent::decode(&test_result("c1", "PASS")).unwrap();
        assert_eq!(event.correlation_token(), Some(&CorrelationToken::from("c1")));
        assert_eq!(event.payload, "PASS");
    }

    #[test]
    fn unrelated_is_other_kind() {
        let event = DeviceEvent::decode(&unrelated("x")).unwrap();
        assert_eq!(event.kind, EventKind::Other);
        assert_eq!(event.id, "x");
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(DeviceEvent::decode(&garbage()).is_err());
    }
}
