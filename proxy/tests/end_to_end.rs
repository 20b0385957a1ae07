//! Full request path over real gRPC: caller → proxy → fake backend → bus → proxy → caller.
//!
//! The fake backend publishes its completion events on an in-memory bus that
//! the proxy's correlation bridge consumes, exactly as the real backend does
//! through the broker.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use futures::future::join_all;
use ondemand_proxy::proto::nem_service_client::NemServiceClient;
use ondemand_proxy::proto::voltha_service_server::{VolthaService, VolthaServiceServer};
use ondemand_proxy::proto::{OmciTestRequest, OnuId, TestResponse, TestResponseResult};
use ondemand_proxy::{FAILURE, OnDemandService, RequestHandler, VolthaActionClient, server};
use ondemand_proxy_core::{ActionClient, EventBus};
use ondemand_proxy_runtime::correlation::DEFAULT_TOPIC;
use ondemand_proxy_runtime::{BridgeConfig, CorrelationBridge, RetryPolicy};
use ondemand_proxy_testing::{InMemoryEventBus, events};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Code, Request, Response, Status};

/// What the fake backend does with a test request.
#[derive(Clone)]
enum Behavior {
    /// Accept, then publish a decoy and the real result
    Publish(&'static str),
    /// Accept and never publish anything
    Silent,
    /// Reply with a final failure status
    Refuse,
    /// Fail the RPC
    Reject(Code),
}

#[derive(Clone)]
struct FakeVoltha {
    bus: Arc<InMemoryEventBus>,
    behavior: Behavior,
    seen: Arc<Mutex<Vec<OmciTestRequest>>>,
}

#[tonic::async_trait]
impl VolthaService for FakeVoltha {
    async fn start_omci_test_action(
        &self,
        request: Request<OmciTestRequest>,
    ) -> Result<Response<TestResponse>, Status> {
        let request = request.into_inner();
        self.seen.lock().unwrap().push(request.clone());

        let result = match &self.behavior {
            Behavior::Publish(title) => {
                let bus = Arc::clone(&self.bus);
                let token = request.uuid.clone();
                let title = *title;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    bus.publish(DEFAULT_TOPIC, &events::test_result("other", "X"))
                        .await
                        .unwrap();
                    bus.publish(DEFAULT_TOPIC, &events::test_result(&token, title))
                        .await
                        .unwrap();
                });
                TestResponseResult::Success
            },
            Behavior::Silent => TestResponseResult::Success,
            Behavior::Refuse => TestResponseResult::Failure,
            Behavior::Reject(code) => return Err(Status::new(*code, "device not found")),
        };

        Ok(Response::new(TestResponse {
            result: result as i32,
        }))
    }
}

struct Harness {
    client: NemServiceClient<Channel>,
    backend_seen: Arc<Mutex<Vec<OmciTestRequest>>>,
    bridge: Arc<CorrelationBridge>,
    _stop: oneshot::Sender<()>,
}

async fn spawn_backend(bus: Arc<InMemoryEventBus>, behavior: Behavior) -> (SocketAddr, Arc<Mutex<Vec<OmciTestRequest>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let fake = FakeVoltha {
        bus,
        behavior,
        seen: Arc::clone(&seen),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(VolthaServiceServer::new(fake))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    (addr, seen)
}

async fn start_proxy(backend: SocketAddr, bus: Arc<InMemoryEventBus>, deadline: Duration) -> Harness {
    let bus_dyn: Arc<dyn EventBus> = bus;
    let bridge = Arc::new(
        CorrelationBridge::start(bus_dyn, BridgeConfig::default())
            .await
            .unwrap(),
    );

    let endpoint = Endpoint::from_shared(format!("http://{backend}"))
        .unwrap()
        .connect_timeout(Duration::from_millis(500));
    let backend: Arc<dyn ActionClient> = Arc::new(VolthaActionClient::with_endpoint(
        endpoint,
        Duration::from_secs(2),
        RetryPolicy::no_retries(),
    ));
    let handler = Arc::new(RequestHandler::new(Arc::clone(&bridge), backend, deadline));

    let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server::serve(
        listener,
        OnDemandService::new(handler),
        None,
        async move {
            let _ = stopped.await;
        },
    ));

    let client = NemServiceClient::connect(format!("http://{addr}")).await.unwrap();
    Harness {
        client,
        backend_seen: Arc::new(Mutex::new(Vec::new())),
        bridge,
        _stop: stop,
    }
}

async fn harness(behavior: Behavior, deadline: Duration) -> Harness {
    let bus = Arc::new(InMemoryEventBus::new());
    let (backend, seen) = spawn_backend(Arc::clone(&bus), behavior).await;
    let mut harness = start_proxy(backend, bus, deadline).await;
    harness.backend_seen = seen;
    harness
}

async fn omci_test(harness: &mut Harness, id: &str) -> Result<String, Status> {
    harness
        .client
        .omci_test(OnuId { id: id.to_string() })
        .await
        .map(|response| response.into_inner().result)
}

#[tokio::test]
async fn returns_the_result_published_for_its_own_token() {
    let mut harness = harness(Behavior::Publish("PASS"), Duration::from_secs(5)).await;

    let result = omci_test(&mut harness, "ONU-42").await.unwrap();
    assert_eq!(result, "PASS");

    let seen = harness.backend_seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].id, "ONU-42");
    assert!(!seen[0].uuid.is_empty());
    assert_eq!(harness.bridge.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_requests_each_get_their_own_result() {
    let harness = harness(Behavior::Publish("PASS"), Duration::from_secs(5)).await;

    let calls = (0..8).map(|i| {
        let mut client = harness.client.clone();
        async move {
            client
                .omci_test(OnuId { id: format!("ONU-{i}") })
                .await
                .map(|r| r.into_inner().result)
        }
    });
    let results = join_all(calls).await;

    assert!(results.iter().all(|r| matches!(r.as_deref(), Ok("PASS"))));
    let tokens: std::collections::HashSet<_> = harness
        .backend_seen
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.uuid.clone())
        .collect();
    assert_eq!(tokens.len(), 8);
}

#[tokio::test]
async fn empty_payload_is_reported_as_failure() {
    let mut harness = harness(Behavior::Publish(""), Duration::from_secs(5)).await;
    assert_eq!(omci_test(&mut harness, "ONU-42").await.unwrap(), FAILURE);
}

#[tokio::test]
async fn final_backend_status_is_reported_as_failure() {
    let mut harness = harness(Behavior::Refuse, Duration::from_secs(5)).await;
    assert_eq!(omci_test(&mut harness, "ONU-42").await.unwrap(), FAILURE);
    assert_eq!(harness.bridge.pending_count(), 0);
}

#[tokio::test]
async fn empty_device_id_is_invalid_and_never_reaches_the_backend() {
    let mut harness = harness(Behavior::Publish("PASS"), Duration::from_secs(5)).await;

    let status = omci_test(&mut harness, "").await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(harness.backend_seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn backend_rejection_is_a_failed_precondition() {
    let mut harness = harness(Behavior::Reject(Code::NotFound), Duration::from_secs(5)).await;

    let status = omci_test(&mut harness, "ONU-42").await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(status.message().contains("device not found"));
}

#[tokio::test]
async fn missing_event_times_out_and_releases_the_entry() {
    let mut harness = harness(Behavior::Silent, Duration::from_millis(200)).await;

    let status = omci_test(&mut harness, "ONU-42").await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(harness.bridge.pending_count(), 0);
}

#[tokio::test]
async fn unreachable_backend_is_unavailable() {
    // Bind then drop a listener to get a port nothing is serving on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut harness = start_proxy(addr, Arc::new(InMemoryEventBus::new()), Duration::from_secs(5)).await;

    let status = omci_test(&mut harness, "ONU-42").await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(harness.bridge.pending_count(), 0);
}
