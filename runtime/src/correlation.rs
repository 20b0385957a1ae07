//! Correlation bridge: one bus subscription shared by every pending request.
//!
//! # Architecture
//!
//! ```text
//! Request Handler → register(token) → PendingSet entry + oneshot receiver
//!                                              ↑
//!                        CorrelationBridge consumer (one per process)
//!                                              ↑
//!                            EventBus subscription ("voltha.events")
//! ```
//!
//! The subscription is established in [`CorrelationBridge::start`], before any
//! request can register, so an event published while the backend call is in
//! flight is never missed.
//!
//! # Usage
//!
//! ```rust,ignore
//! let bridge = CorrelationBridge::start(bus, BridgeConfig::default()).await?;
//!
//! let token = CorrelationToken::generate();
//! let registration = bridge.register(token.clone())?;
//! backend.start_test_action(device_id, &token).await?;
//! let event = registration.wait(Duration::from_secs(300)).await?;
//! ```

use crate::metrics::BridgeMetrics;
use crate::pending::{PendingSet, Resolution};
use futures::StreamExt;
use ondemand_proxy_core::{CorrelationToken, DeviceEvent, EventBus, EventBusError, EventStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Topic the backend publishes device events on.
pub const DEFAULT_TOPIC: &str = "voltha.events";

/// Errors from starting the bridge or registering with it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The startup subscription failed
    #[error("Failed to subscribe: {0}")]
    Subscribe(#[from] EventBusError),

    /// A live registration already holds this token
    #[error("Correlation token already pending: {0}")]
    DuplicateToken(CorrelationToken),

    /// The bridge has stopped consuming
    #[error("Correlation bridge is closed")]
    Closed,
}

/// Ways waiting for a completion event can end without one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No matching event before the deadline
    #[error("No completion event within {0:?}")]
    TimedOut(Duration),

    /// The bridge stopped while the request was waiting
    #[error("Correlation bridge closed while waiting")]
    BridgeClosed,

    /// The entry outlived the bridge's grace period
    #[error("Pending entry evicted")]
    Evicted,
}

/// Bridge tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Topic to subscribe to
    pub topic: String,
    /// Age after which the sweeper evicts a pending entry
    pub grace_period: Duration,
    /// How often the sweeper runs
    pub sweep_interval: Duration,
    /// Pause after a transport error before pulling again
    pub transport_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            grace_period: Duration::from_secs(330),
            sweep_interval: Duration::from_secs(30),
            transport_backoff: Duration::from_secs(1),
        }
    }
}

/// Multiplexes one event subscription across many waiting requests.
pub struct CorrelationBridge {
    pending: PendingSet,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    topic: String,
    // Keeps the bus (and so the subscription's source) alive with the bridge.
    _bus: Arc<dyn EventBus>,
}

impl CorrelationBridge {
    /// Subscribe to `config.topic` and start the consumer and sweeper tasks.
    ///
    /// Returns once the subscription is established.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Subscribe`] if the subscription cannot be made.
    pub async fn start(bus: Arc<dyn EventBus>, config: BridgeConfig) -> Result<Self, BridgeError> {
        let stream = bus.subscribe(&config.topic).await?;
        tracing::info!(
            topic = %config.topic,
            grace_period = ?config.grace_period,
            "Correlation bridge subscribed"
        );

        let pending = PendingSet::default();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let consumer = tokio::spawn(consume_loop(
            stream,
            pending.clone(),
            shutdown_rx.clone(),
            config.transport_backoff,
        ));
        let sweeper = tokio::spawn(sweep_loop(
            pending.clone(),
            shutdown_rx,
            config.grace_period,
            config.sweep_interval,
        ));

        Ok(Self {
            pending,
            shutdown,
            tasks: Mutex::new(vec![consumer, sweeper]),
            topic: config.topic,
            _bus: bus,
        })
    }

    /// Register interest in the event carrying `token`.
    ///
    /// Must be called before the backend action is started.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::DuplicateToken`] if a live registration holds `token`
    /// - [`BridgeError::Closed`] if the bridge has stopped
    pub fn register(&self, token: CorrelationToken) -> Result<Registration, BridgeError> {
        let (id, receiver) = self.pending.insert(&token)?;
        BridgeMetrics::record_pending(self.pending.len());
        tracing::trace!(token = %token, "Registered pending request");
        Ok(Registration {
            token,
            id,
            receiver,
            pending: self.pending.clone(),
        })
    }

    /// Number of requests currently waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Topic the bridge consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop consuming and wake every waiter with [`WaitError::BridgeClosed`].
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.pending.close();
        tracing::info!(topic = %self.topic, "Correlation bridge stopped");
    }
}

impl Drop for CorrelationBridge {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.pending.close();
    }
}

/// A request's claim on one correlation token.
///
/// Dropping the registration removes its pending entry if it is still there,
/// whichever way the request ends.
#[derive(Debug)]
pub struct Registration {
    token: CorrelationToken,
    id: u64,
    receiver: oneshot::Receiver<Resolution>,
    pending: PendingSet,
}

impl Registration {
    /// The registered token.
    #[must_use]
    pub const fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Wait up to `deadline` for the matching event.
    ///
    /// The entry's eviction age restarts here, so time spent before waiting
    /// (the backend call) does not count against the grace period.
    ///
    /// # Errors
    ///
    /// - [`WaitError::TimedOut`] when the deadline elapses first
    /// - [`WaitError::Evicted`] when the sweeper removed the entry
    /// - [`WaitError::BridgeClosed`] when the bridge stopped
    pub async fn wait(mut self, deadline: Duration) -> Result<DeviceEvent, WaitError> {
        self.pending.touch(&self.token, self.id);
        match tokio::time::timeout(deadline, &mut self.receiver).await {
            Ok(Ok(Resolution::Matched(event))) => Ok(event),
            Ok(Ok(Resolution::Evicted)) => Err(WaitError::Evicted),
            Ok(Err(_)) => Err(WaitError::BridgeClosed),
            Err(_) => Err(WaitError::TimedOut(deadline)),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.pending.remove(&self.token, self.id) {
            tracing::trace!(token = %self.token, "Removed pending request");
            BridgeMetrics::record_pending(self.pending.len());
        }
    }
}

async fn consume_loop(
    mut stream: EventStream,
    pending: PendingSet,
    mut shutdown: watch::Receiver<bool>,
    transport_backoff: Duration,
) {
    tracing::debug!("Correlation bridge consumer started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => dispatch(&pending, event),
            Some(Err(e)) if e.is_message_error() => {
                BridgeMetrics::record_decode_error();
                tracing::warn!(error = %e, "Skipping undecodable event");
            }
            Some(Err(e)) => {
                BridgeMetrics::record_transport_error();
                tracing::error!(error = %e, backoff = ?transport_backoff, "Event stream transport error");
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(transport_backoff) => {}
                }
            }
            None => {
                tracing::warn!("Event stream ended");
                break;
            }
        }
    }

    // Nothing can be delivered any more; release every waiter.
    pending.close();
    BridgeMetrics::record_pending(0);
    tracing::debug!("Correlation bridge consumer stopped");
}

fn dispatch(pending: &PendingSet, event: DeviceEvent) {
    BridgeMetrics::record_consumed();

    let Some(token) = event.correlation_token().cloned() else {
        tracing::trace!(event_id = %event.id, kind = ?event.kind, "Ignoring uncorrelated event");
        return;
    };

    if pending.resolve(&token, event) {
        BridgeMetrics::record_matched();
        BridgeMetrics::record_pending(pending.len());
        tracing::debug!(token = %token, "Delivered completion event");
    } else {
        tracing::trace!(token = %token, "No pending request for token");
    }
}

async fn sweep_loop(
    pending: PendingSet,
    mut shutdown: watch::Receiver<bool>,
    grace_period: Duration,
    sweep_interval: Duration,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let evicted = pending.evict_older_than(grace_period, Instant::now());
                if evicted > 0 {
                    BridgeMetrics::record_evicted(evicted);
                    BridgeMetrics::record_pending(pending.len());
                    tracing::warn!(evicted, "Evicted pending requests past the grace period");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ondemand_proxy_testing::{InMemoryEventBus, events};

    async fn bridge_on(bus: &Arc<InMemoryEventBus>, config: BridgeConfig) -> CorrelationBridge {
        CorrelationBridge::start(Arc::clone(bus) as Arc<dyn EventBus>, config)
            .await
            .expect("bridge starts")
    }

    #[tokio::test]
    async fn subscribes_before_returning() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = bridge_on(&bus, BridgeConfig::default()).await;

        assert_eq!(bus.subscriber_count(DEFAULT_TOPIC), 1);
        assert_eq!(bridge.topic(), DEFAULT_TOPIC);
    }

    #[tokio::test]
    async fn start_fails_when_subscription_fails() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.fail_subscriptions();

        let result = CorrelationBridge::start(bus as Arc<dyn EventBus>, BridgeConfig::default()).await;
        assert!(matches!(result, Err(BridgeError::Subscribe(_))));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = bridge_on(&bus, BridgeConfig::default()).await;

        let _first = bridge.register(CorrelationToken::from("c1")).unwrap();
        assert_eq!(
            bridge.register(CorrelationToken::from("c1")).unwrap_err(),
            BridgeError::DuplicateToken(CorrelationToken::from("c1"))
        );
    }

    #[tokio::test]
    async fn dropping_registration_removes_entry() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = bridge_on(&bus, BridgeConfig::default()).await;

        let registration = bridge.register(CorrelationToken::from("c1")).unwrap();
        assert_eq!(bridge.pending_count(), 1);
        drop(registration);
        assert_eq!(bridge.pending_count(), 0);

        // The token can be reused once released.
        let _again = bridge.register(CorrelationToken::from("c1")).unwrap();
    }

    #[tokio::test]
    async fn matching_event_wakes_waiter() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = bridge_on(&bus, BridgeConfig::default()).await;
        let registration = bridge.register(CorrelationToken::from("c1")).unwrap();

        bus.publish(DEFAULT_TOPIC, &events::test_result("other", "X")).await.unwrap();
        bus.publish(DEFAULT_TOPIC, &events::test_result("c1", "PASS")).await.unwrap();

        let event = registration.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.payload, "PASS");
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = bridge_on(&bus, BridgeConfig::default()).await;
        let registration = bridge.register(CorrelationToken::from("slow")).unwrap();

        let result = registration.wait(Duration::from_secs(2)).await;
        assert_eq!(result.unwrap_err(), WaitError::TimedOut(Duration::from_secs(2)));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_stale_entries() {
        let bus = Arc::new(InMemoryEventBus::new());
        let config = BridgeConfig {
            grace_period: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            ..BridgeConfig::default()
        };
        let bridge = bridge_on(&bus, config).await;
        let registration = bridge.register(CorrelationToken::from("stuck")).unwrap();

        let result = registration.wait(Duration::from_secs(60)).await;
        assert_eq!(result.unwrap_err(), WaitError::Evicted);
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_before_waiting_does_not_count_towards_eviction() {
        let bus = Arc::new(InMemoryEventBus::new());
        let config = BridgeConfig {
            grace_period: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            ..BridgeConfig::default()
        };
        let bridge = bridge_on(&bus, config).await;
        let registration = bridge.register(CorrelationToken::from("c1")).unwrap();

        // A slow backend call, shorter than the grace period.
        tokio::time::sleep(Duration::from_secs(8)).await;

        let publisher = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move {
                tokio::time::sleep(Duration::from_secs(7)).await;
                bus.publish(DEFAULT_TOPIC, &events::test_result("c1", "PASS"))
                    .await
                    .unwrap();
            }
        });

        let event = registration.wait(Duration::from_secs(9)).await.unwrap();
        assert_eq!(event.payload, "PASS");
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_refuses_registrations() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = bridge_on(&bus, BridgeConfig::default()).await;
        let registration = bridge.register(CorrelationToken::from("c1")).unwrap();

        bridge.shutdown().await;

        assert_eq!(
            registration.wait(Duration::from_secs(5)).await.unwrap_err(),
            WaitError::BridgeClosed
        );
        assert_eq!(
            bridge.register(CorrelationToken::from("c2")).unwrap_err(),
            BridgeError::Closed
        );
    }

    #[tokio::test]
    async fn end_of_stream_closes_bridge() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = bridge_on(&bus, BridgeConfig::default()).await;
        let registration = bridge.register(CorrelationToken::from("c1")).unwrap();

        bus.close_topic(DEFAULT_TOPIC);

        assert_eq!(
            registration.wait(Duration::from_secs(5)).await.unwrap_err(),
            WaitError::BridgeClosed
        );
    }
}
