//! The backend test action.
//!
//! The proxy invokes exactly one backend RPC: start a diagnostic test on a
//! device, tagged with a correlation token. The immediate reply only says
//! whether the backend accepted the action; the result itself is published on
//! the event bus later.

use crate::token::CorrelationToken;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Status code meaning "accepted, the result will arrive on the bus".
pub const PENDING_STATUS: i32 = 0;

/// Classification of the backend's immediate reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The backend accepted the action; wait for the completion event.
    Pending,
    /// The backend answered with a final status; no event will follow.
    Terminal {
        /// Raw status code returned by the backend.
        status: i32,
    },
}

impl ActionOutcome {
    /// Classify a backend status code.
    #[must_use]
    pub const fn from_status(status: i32) -> Self {
        if status == PENDING_STATUS {
            Self::Pending
        } else {
            Self::Terminal { status }
        }
    }

    /// Whether a completion event is expected.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Errors from invoking the backend action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Could not dial or reach the backend.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend was reached but refused or failed the call.
    #[error("Action rejected ({code}): {message}")]
    ActionRejected {
        /// RPC status code name reported for the failure.
        code: String,
        /// Message attached to the failure.
        message: String,
    },
}

impl BackendError {
    /// Whether retrying the call could help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Client for the backend's test action.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so handlers can hold an
/// `Arc<dyn ActionClient>` and tests can swap in a scripted mock.
pub trait ActionClient: Send + Sync {
    /// Start the test action on `device_id`, tagging it with `token`.
    ///
    /// # Errors
    ///
    /// - [`BackendError::Unavailable`] if the backend cannot be reached
    /// - [`BackendError::ActionRejected`] if the call itself fails
    fn start_test_action<'a>(
        &'a self,
        device_id: &'a str,
        token: &'a CorrelationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, BackendError>> + Send + 'a>>;
}
