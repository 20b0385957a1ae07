//! Proxy error types and their mapping onto gRPC status codes.
//!
//! # Mapping
//!
//! - **InvalidArgument**: empty device id
//! - **Unavailable**: the backend could not be reached
//! - **FailedPrecondition**: the backend rejected the test action
//! - **DeadlineExceeded**: no completion event before the request deadline
//! - **Aborted**: the correlation bridge stopped or evicted the request
//! - **Internal**: correlation token collision or other bridge faults

use ondemand_proxy_core::BackendError;
use ondemand_proxy_runtime::{BridgeError, WaitError};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};

/// Failures of a single test request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The request itself is malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend action could not be started
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// No completion event arrived in time
    #[error("Timed out after {0:?} waiting for the test result")]
    Timeout(Duration),

    /// Waiting ended without a result for another reason
    #[error(transparent)]
    Wait(WaitError),

    /// The request could not be registered with the bridge
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl From<WaitError> for HandlerError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut(deadline) => Self::Timeout(deadline),
            other => Self::Wait(other),
        }
    }
}

impl HandlerError {
    /// Short label used for the `outcome` metric.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Backend(BackendError::Unavailable(_)) => "backend_unavailable",
            Self::Backend(BackendError::ActionRejected { .. }) => "action_rejected",
            Self::Timeout(_) => "timed_out",
            Self::Wait(_) | Self::Bridge(BridgeError::Closed) => "aborted",
            Self::Bridge(_) => "internal",
        }
    }
}

/// Map a [`HandlerError`] to the gRPC status returned to the caller.
#[must_use]
pub fn map_handler_error_to_status(err: &HandlerError) -> Status {
    let code = match err {
        HandlerError::InvalidArgument(_) => Code::InvalidArgument,
        HandlerError::Backend(BackendError::Unavailable(_)) => Code::Unavailable,
        HandlerError::Backend(BackendError::ActionRejected { .. }) => Code::FailedPrecondition,
        HandlerError::Timeout(_) => Code::DeadlineExceeded,
        HandlerError::Wait(_) | HandlerError::Bridge(BridgeError::Closed) => Code::Aborted,
        HandlerError::Bridge(_) => Code::Internal,
    };
    Status::new(code, err.to_string())
}

impl From<HandlerError> for Status {
    fn from(err: HandlerError) -> Self {
        map_handler_error_to_status(&err)
    }
}

/// Fatal errors while bringing the proxy up.
#[derive(Error, Debug)]
pub enum StartupError {
    /// A TLS certificate or key could not be read
    #[error("Failed to read TLS file {path}: {source}")]
    TlsFile {
        /// File that failed to load
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// TLS settings are incomplete
    #[error("Invalid TLS configuration: {0}")]
    Tls(String),

    /// The backend endpoint could not be configured
    #[error("Invalid backend endpoint '{address}': {source}")]
    Endpoint {
        /// Configured backend address
        address: String,
        /// Transport error
        source: tonic::transport::Error,
    },

    /// The listen socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address
        addr: SocketAddr,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The gRPC server failed
    #[error("gRPC server error: {0}")]
    Serve(#[from] tonic::transport::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ondemand_proxy_core::CorrelationToken;

    fn code(err: HandlerError) -> Code {
        Status::from(err).code()
    }

    #[test]
    fn each_failure_maps_to_its_status() {
        assert_eq!(code(HandlerError::InvalidArgument("empty".into())), Code::InvalidArgument);
        assert_eq!(
            code(BackendError::Unavailable("refused".into()).into()),
            Code::Unavailable
        );
        assert_eq!(
            code(
                BackendError::ActionRejected {
                    code: "NotFound".into(),
                    message: "no such device".into(),
                }
                .into()
            ),
            Code::FailedPrecondition
        );
        assert_eq!(
            code(WaitError::TimedOut(Duration::from_secs(1)).into()),
            Code::DeadlineExceeded
        );
        assert_eq!(code(WaitError::BridgeClosed.into()), Code::Aborted);
        assert_eq!(code(WaitError::Evicted.into()), Code::Aborted);
        assert_eq!(code(BridgeError::Closed.into()), Code::Aborted);
        assert_eq!(
            code(BridgeError::DuplicateToken(CorrelationToken::from("c1")).into()),
            Code::Internal
        );
    }

    #[test]
    fn rejection_message_reaches_the_caller() {
        let status = Status::from(HandlerError::from(BackendError::ActionRejected {
            code: "NotFound".into(),
            message: "no such device".into(),
        }));
        assert!(status.message().contains("no such device"));
    }

    #[test]
    fn timed_out_wait_becomes_timeout() {
        assert_eq!(
            HandlerError::from(WaitError::TimedOut(Duration::from_secs(3))),
            HandlerError::Timeout(Duration::from_secs(3))
        );
    }
}
