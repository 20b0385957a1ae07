//! Operator-facing gRPC surface.

use crate::backend::read_pem;
use crate::config::TlsConfig;
use crate::error::StartupError;
use crate::handler::RequestHandler;
use crate::proto::nem_service_server::{NemService, NemServiceServer};
use crate::proto::{OnuId, ResponseTest};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

/// `NemService` implementation; delegates every call to the [`RequestHandler`].
#[derive(Clone)]
pub struct OnDemandService {
    handler: Arc<RequestHandler>,
}

impl OnDemandService {
    /// Wrap a handler.
    #[must_use]
    pub const fn new(handler: Arc<RequestHandler>) -> Self {
        Self { handler }
    }

    /// The tonic service to mount on a server.
    #[must_use]
    pub fn into_server(self) -> NemServiceServer<Self> {
        NemServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl NemService for OnDemandService {
    async fn omci_test(&self, request: Request<OnuId>) -> Result<Response<ResponseTest>, Status> {
        let device_id = request.into_inner().id;
        tracing::info!(device_id = %device_id, "Test requested");

        let result = self.handler.handle(&device_id).await?;
        Ok(Response::new(ResponseTest { result }))
    }
}

/// Bind the listen socket.
///
/// # Errors
///
/// Returns [`StartupError::Bind`] if the address is unavailable.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })
}

/// Server TLS settings, if TLS is enabled.
///
/// The proxy presents `cert`/`key`; when `ca_cert` is set, clients must
/// present a certificate signed by it.
///
/// # Errors
///
/// Returns [`StartupError`] if TLS is on without a certificate pair, or a file
/// cannot be read.
pub fn server_tls_config(tls: &TlsConfig) -> Result<Option<ServerTlsConfig>, StartupError> {
    if !tls.use_tls {
        return Ok(None);
    }
    let (Some(cert), Some(key)) = (&tls.cert, &tls.key) else {
        return Err(StartupError::Tls(
            "serving with TLS requires both a certificate and a key".into(),
        ));
    };

    let mut config = ServerTlsConfig::new().identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
    if let Some(ca) = &tls.ca_cert {
        config = config.client_ca_root(Certificate::from_pem(read_pem(ca)?));
    }
    Ok(Some(config))
}

/// Serve `service` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`StartupError`] if TLS cannot be applied or the server fails.
pub async fn serve(
    listener: TcpListener,
    service: OnDemandService,
    tls: Option<ServerTlsConfig>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), StartupError> {
    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }

    builder
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;
    Ok(())
}
