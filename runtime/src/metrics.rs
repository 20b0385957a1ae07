//! Prometheus metrics for the proxy.
//!
//! Recording is always cheap: without an installed recorder the `metrics`
//! macros are no-ops. [`MetricsServer`] installs the Prometheus recorder and
//! its scrape endpoint when an address is configured.
//!
//! # Example
//!
//! ```rust,no_run
//! use ondemand_proxy_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Events pulled from the bus by the bridge.
pub const EVENTS_CONSUMED: &str = "bridge_events_consumed_total";
/// Events delivered to a pending request.
pub const EVENTS_MATCHED: &str = "bridge_events_matched_total";
/// Messages that could not be decoded.
pub const DECODE_ERRORS: &str = "bridge_decode_errors_total";
/// Transport errors seen on the subscription.
pub const TRANSPORT_ERRORS: &str = "bridge_transport_errors_total";
/// Pending entries removed by the sweeper.
pub const ENTRIES_EVICTED: &str = "bridge_entries_evicted_total";
/// Current size of the pending set.
pub const PENDING_REQUESTS: &str = "bridge_pending_requests";
/// Handled requests, labelled by `outcome`.
pub const REQUESTS: &str = "requests_total";
/// End-to-end request latency.
pub const REQUEST_DURATION: &str = "request_duration_seconds";

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// A global recorder is already installed
    #[error("A metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`MetricsError::Build`] if the exporter cannot be built (for example the
    /// address cannot be bound), [`MetricsError::AlreadyInstalled`] if another
    /// recorder owns the global slot.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics exporter stopped");
            }
        });

        tracing::info!(%addr, "Metrics available at http://{addr}/metrics");
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION.to_string()),
            &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(EVENTS_CONSUMED, "Events pulled from the bus by the correlation bridge");
    describe_counter!(EVENTS_MATCHED, "Events delivered to a pending request");
    describe_counter!(DECODE_ERRORS, "Bus messages that could not be decoded");
    describe_counter!(TRANSPORT_ERRORS, "Transport errors on the bridge subscription");
    describe_counter!(ENTRIES_EVICTED, "Pending entries evicted after the grace period");
    describe_gauge!(PENDING_REQUESTS, "Requests currently waiting for a completion event");
    describe_counter!(REQUESTS, "Handled test requests by outcome");
    describe_histogram!(REQUEST_DURATION, "Time from request arrival to response");
}

/// Correlation bridge metrics recorder.
pub struct BridgeMetrics;

impl BridgeMetrics {
    /// Record an event pulled from the bus.
    pub fn record_consumed() {
        counter!(EVENTS_CONSUMED).increment(1);
    }

    /// Record an event delivered to its waiter.
    pub fn record_matched() {
        counter!(EVENTS_MATCHED).increment(1);
    }

    /// Record an undecodable message.
    pub fn record_decode_error() {
        counter!(DECODE_ERRORS).increment(1);
    }

    /// Record a transport error.
    pub fn record_transport_error() {
        counter!(TRANSPORT_ERRORS).increment(1);
    }

    /// Record entries evicted by one sweep.
    pub fn record_evicted(count: usize) {
        counter!(ENTRIES_EVICTED).increment(u64::try_from(count).unwrap_or(u64::MAX));
    }

    /// Publish the current pending-set size.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pending(len: usize) {
        gauge!(PENDING_REQUESTS).set(len as f64);
    }
}

/// Request handler metrics recorder.
pub struct RequestMetrics;

impl RequestMetrics {
    /// Record a finished request with its outcome label.
    pub fn record(outcome: &'static str, duration: Duration) {
        counter!(REQUESTS, "outcome" => outcome).increment(1);
        histogram!(REQUEST_DURATION).record(duration.as_secs_f64());
    }
}
