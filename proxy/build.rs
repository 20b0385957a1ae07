//! Build script for the proxy
//!
//! Generates the gRPC client and server stubs for the operator-facing
//! `NemService` and the backend's `VolthaService`. Message types are written
//! by hand in `src/proto.rs`, so no `protoc` is needed.

use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let nem = Service::builder()
        .name("NemService")
        .package("nem_ondemand_api")
        .method(method(
            "omci_test",
            "OmciTest",
            "crate::proto::OnuId",
            "crate::proto::ResponseTest",
        ))
        .build();

    let voltha = Service::builder()
        .name("VolthaService")
        .package("voltha")
        .method(method(
            "start_omci_test_action",
            "StartOmciTestAction",
            "crate::proto::OmciTestRequest",
            "crate::proto::TestResponse",
        ))
        .build();

    Builder::new().compile(&[nem, voltha]);
}
