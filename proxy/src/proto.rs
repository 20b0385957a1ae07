//! Wire types for the two gRPC services the proxy speaks.
//!
//! `nem_ondemand_api.NemService` is served to operators;
//! `voltha.VolthaService` is the backend the test action is started on. Only
//! the messages these calls need are modelled.

/// Device selector sent by the operator.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OnuId {
    /// Device identifier.
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
}

/// Result returned to the operator.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseTest {
    /// Rendered test result, or `FAILURE`.
    #[prost(string, tag = "1")]
    pub result: ::prost::alloc::string::String,
}

/// Backend request to start the OMCI test on a device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OmciTestRequest {
    /// Device identifier.
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    /// Correlation token echoed in the completion event.
    #[prost(string, tag = "2")]
    pub uuid: ::prost::alloc::string::String,
}

/// Backend's immediate reply to [`OmciTestRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TestResponse {
    /// A [`TestResponseResult`] value.
    #[prost(enumeration = "TestResponseResult", tag = "1")]
    pub result: i32,
}

/// Status codes carried by [`TestResponse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TestResponseResult {
    /// Accepted; the result follows on the event bus.
    Success = 0,
    /// Refused.
    Failure = 1,
}

#[allow(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/nem_ondemand_api.NemService.rs"));
    include!(concat!(env!("OUT_DIR"), "/voltha.VolthaService.rs"));
}

pub use generated::{nem_service_client, nem_service_server, voltha_service_client, voltha_service_server};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn omci_request_field_numbers() {
        let bytes = OmciTestRequest {
            id: "ONU-42".into(),
            uuid: "c1".into(),
        }
        .encode_to_vec();

        // field 1 (len-delimited) "ONU-42", field 2 "c1"
        assert_eq!(bytes[0], 0x0a);
        assert_eq!(bytes[8], 0x12);
        assert_eq!(OmciTestRequest::decode(bytes.as_slice()).unwrap().uuid, "c1");
    }

    #[test]
    fn success_is_the_zero_status() {
        assert_eq!(TestResponseResult::Success as i32, 0);
        assert_eq!(TestResponse::default().result, 0);
        assert_eq!(
            TestResponse {
                result: TestResponseResult::Failure.into(),
            }
            .result(),
            TestResponseResult::Failure
        );
    }
}
