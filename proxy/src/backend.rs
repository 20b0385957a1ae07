//! gRPC client for the backend's test action.

use crate::config::{ProxyConfig, TlsConfig};
use crate::error::StartupError;
use crate::proto::OmciTestRequest;
use crate::proto::voltha_service_client::VolthaServiceClient;
use ondemand_proxy_core::{ActionClient, ActionOutcome, BackendError, CorrelationToken};
use ondemand_proxy_runtime::RetryPolicy;
use ondemand_proxy_runtime::retry::retry_with_predicate;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::OnceCell;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Code, Status};

/// Starts OMCI tests on the backend management service.
///
/// The channel is dialled on first use and then shared by every call; a failed
/// dial is retried on the next call.
pub struct VolthaActionClient {
    endpoint: Endpoint,
    channel: OnceCell<Channel>,
    action_timeout: Duration,
    retry: RetryPolicy,
}

impl VolthaActionClient {
    /// Create a client from the proxy configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if the address is malformed or TLS material
    /// cannot be loaded.
    pub fn new(config: &ProxyConfig) -> Result<Self, StartupError> {
        let endpoint = backend_endpoint(&config.server, &config.tls, config.grpc.action_timeout)?;
        Ok(Self::with_endpoint(
            endpoint,
            config.grpc.action_timeout,
            config.retry_policy(),
        ))
    }

    /// Create a client for an already configured endpoint.
    #[must_use]
    pub fn with_endpoint(endpoint: Endpoint, action_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            endpoint,
            channel: OnceCell::new(),
            action_timeout,
            retry,
        }
    }

    async fn channel(&self) -> Result<Channel, BackendError> {
        self.channel
            .get_or_try_init(|| async {
                tracing::debug!(uri = %self.endpoint.uri(), "Dialling backend");
                self.endpoint
                    .connect()
                    .await
                    .map_err(|e| BackendError::Unavailable(format!("{}: {e}", self.endpoint.uri())))
            })
            .await
            .cloned()
    }

    async fn start_once(
        &self,
        device_id: &str,
        token: &CorrelationToken,
    ) -> Result<ActionOutcome, BackendError> {
        let mut client = VolthaServiceClient::new(self.channel().await?);

        let mut request = tonic::Request::new(OmciTestRequest {
            id: device_id.to_string(),
            uuid: token.to_string(),
        });
        request.set_timeout(self.action_timeout);

        let response = tokio::time::timeout(self.action_timeout, client.start_omci_test_action(request))
            .await
            .map_err(|_| BackendError::ActionRejected {
                code: format!("{:?}", Code::DeadlineExceeded),
                message: format!("no reply within {:?}", self.action_timeout),
            })?
            .map_err(status_to_backend_error)?;

        let status = response.into_inner().result;
        tracing::debug!(device_id, token = %token, status, "Backend replied");
        Ok(ActionOutcome::from_status(status))
    }
}

impl ActionClient for VolthaActionClient {
    fn start_test_action<'a>(
        &'a self,
        device_id: &'a str,
        token: &'a CorrelationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, BackendError>> + Send + 'a>> {
        Box::pin(retry_with_predicate(
            &self.retry,
            move || self.start_once(device_id, token),
            BackendError::is_transient,
        ))
    }
}

/// Classify an RPC failure.
///
/// `Unavailable` is a transport problem worth retrying; every other status is
/// the backend refusing the action.
#[must_use]
pub fn status_to_backend_error(status: Status) -> BackendError {
    match status.code() {
        Code::Unavailable => BackendError::Unavailable(status.message().to_string()),
        code => BackendError::ActionRejected {
            code: format!("{code:?}"),
            message: status.message().to_string(),
        },
    }
}

/// Build the backend endpoint, plaintext or TLS.
///
/// # Errors
///
/// Returns [`StartupError`] for a malformed address or unreadable TLS files.
pub fn backend_endpoint(
    address: &str,
    tls: &TlsConfig,
    connect_timeout: Duration,
) -> Result<Endpoint, StartupError> {
    let scheme = if tls.use_tls { "https" } else { "http" };
    let uri = if address.contains("://") {
        address.to_string()
    } else {
        format!("{scheme}://{address}")
    };

    let endpoint = Endpoint::from_shared(uri)
        .map_err(|source| StartupError::Endpoint {
            address: address.to_string(),
            source,
        })?
        .connect_timeout(connect_timeout);

    if !tls.use_tls {
        return Ok(endpoint);
    }

    let mut client_tls = ClientTlsConfig::new();
    if let Some(ca) = &tls.ca_cert {
        client_tls = client_tls.ca_certificate(Certificate::from_pem(read_pem(ca)?));
    }
    if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
        client_tls = client_tls.identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
    }
    if let Some(domain) = &tls.verify {
        client_tls = client_tls.domain_name(domain.clone());
    }

    endpoint
        .tls_config(client_tls)
        .map_err(|source| StartupError::Endpoint {
            address: address.to_string(),
            source,
        })
}

pub(crate) fn read_pem(path: &Path) -> Result<Vec<u8>, StartupError> {
    std::fs::read(path).map_err(|source| StartupError::TlsFile {
        path: path.to_path_buf(),
        source,
    })
}
