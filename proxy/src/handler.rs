//! Per-request flow: register, start the backend action, wait for the event.
//!
//! ```text
//! Created → AwaitingBackendAck → Failed          (terminal status or backend error)
//!                              → AwaitingEvent   → Completed | TimedOut | Aborted
//! ```
//!
//! The registration is made before the backend is called. Dropping the handler
//! future (client disconnect) drops the registration, which removes the pending
//! entry.

use crate::error::HandlerError;
use ondemand_proxy_core::{ActionClient, ActionOutcome, CorrelationToken};
use ondemand_proxy_runtime::CorrelationBridge;
use ondemand_proxy_runtime::metrics::RequestMetrics;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Result string returned when there is no usable test result.
pub const FAILURE: &str = "FAILURE";

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Token generated, nothing sent yet
    Created,
    /// Backend call in flight
    AwaitingBackendAck,
    /// Backend accepted; waiting for the completion event
    AwaitingEvent,
    /// A result string was produced
    Completed,
    /// The backend gave a final answer or failed
    Failed,
    /// No completion event before the deadline
    TimedOut,
    /// The bridge stopped or evicted the request
    Aborted,
}

impl RequestState {
    const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Aborted
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks one request's state for logging and metrics.
///
/// Dropped before reaching a terminal state means the caller went away.
struct Request<'a> {
    device_id: &'a str,
    token: CorrelationToken,
    state: RequestState,
    started: Instant,
}

impl<'a> Request<'a> {
    fn new(device_id: &'a str, token: CorrelationToken) -> Self {
        tracing::debug!(device_id, token = %token, "Request created");
        Self {
            device_id,
            token,
            state: RequestState::Created,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: RequestState) {
        tracing::debug!(
            device_id = self.device_id,
            token = %self.token,
            from = %self.state,
            to = %next,
            "Request state change"
        );
        self.state = next;
    }

    fn finish(mut self, next: RequestState, outcome: &'static str) {
        self.advance(next);
        RequestMetrics::record(outcome, self.started.elapsed());
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::info!(
                device_id = self.device_id,
                token = %self.token,
                state = %self.state,
                "Request cancelled by caller"
            );
            RequestMetrics::record("cancelled", self.started.elapsed());
        }
    }
}

/// Runs test requests against the backend and the correlation bridge.
#[derive(Clone)]
pub struct RequestHandler {
    bridge: Arc<CorrelationBridge>,
    backend: Arc<dyn ActionClient>,
    deadline: Duration,
}

impl RequestHandler {
    /// Create a handler that waits at most `deadline` for each result.
    #[must_use]
    pub fn new(
        bridge: Arc<CorrelationBridge>,
        backend: Arc<dyn ActionClient>,
        deadline: Duration,
    ) -> Self {
        Self {
            bridge,
            backend,
            deadline,
        }
    }

    /// Run the test on `device_id` and return its result.
    ///
    /// Returns [`FAILURE`] when the backend answers with a final status instead
    /// of accepting the action, or when the completion event has no payload.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::InvalidArgument`] for an empty device id
    /// - [`HandlerError::Backend`] if the backend cannot be reached or rejects
    ///   the call
    /// - [`HandlerError::Timeout`] if no completion event arrives in time
    /// - [`HandlerError::Wait`] / [`HandlerError::Bridge`] if the bridge cannot
    ///   serve the request
    pub async fn handle(&self, device_id: &str) -> Result<String, HandlerError> {
        if device_id.trim().is_empty() {
            RequestMetrics::record("invalid_argument", Duration::ZERO);
            return Err(HandlerError::InvalidArgument(
                "device id must not be empty".into(),
            ));
        }

        let token = CorrelationToken::generate();
        let mut request = Request::new(device_id, token.clone());

        let registration = match self.bridge.register(token.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                let err = HandlerError::from(e);
                request.finish(RequestState::Failed, err.outcome());
                return Err(err);
            }
        };

        request.advance(RequestState::AwaitingBackendAck);
        let outcome = match self.backend.start_test_action(device_id, &token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(device_id, token = %token, error = %e, "Backend call failed");
                let err = HandlerError::from(e);
                request.finish(RequestState::Failed, err.outcome());
                return Err(err);
            }
        };

        if let ActionOutcome::Terminal { status } = outcome {
            drop(registration);
            tracing::info!(device_id, token = %token, status, "Backend returned a final status");
            request.finish(RequestState::Failed, "terminal");
            return Ok(FAILURE.to_string());
        }

        request.advance(RequestState::AwaitingEvent);
        match registration.wait(self.deadline).await {
            Ok(event) if event.payload.is_empty() => {
                tracing::info!(device_id, token = %token, "Completion event had no payload");
                request.finish(RequestState::Completed, "empty_payload");
                Ok(FAILURE.to_string())
            }
            Ok(event) => {
                tracing::info!(device_id, token = %token, result = %event.payload, "Test completed");
                request.finish(RequestState::Completed, "matched");
                Ok(event.payload)
            }
            Err(e) => {
                let err = HandlerError::from(e);
                let state = if matches!(err, HandlerError::Timeout(_)) {
                    RequestState::TimedOut
                } else {
                    RequestState::Aborted
                };
                tracing::warn!(device_id, token = %token, error = %err, "No test result");
                request.finish(state, err.outcome());
                Err(err)
            }
        }
    }
}
