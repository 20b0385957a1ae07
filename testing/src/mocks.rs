//! Mock implementations of the proxy's external collaborators.

#![allow(clippy::missing_panics_doc)] // Test utilities

use ondemand_proxy_core::action::{ActionClient, ActionOutcome, BackendError};
use ondemand_proxy_core::event_bus::{EventBus, EventBusError, EventStream, decode_message};
use ondemand_proxy_core::token::CorrelationToken;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default per-topic channel capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
enum Delivery {
    Message(Vec<u8>),
    Fault(String),
}

/// In-memory event bus for tests.
///
/// One `tokio::sync::broadcast` channel per topic. Like a consumer positioned
/// at the newest offset, a subscriber only sees what is published after it
/// subscribed. Messages go through the same decode path as the Kafka client.
#[derive(Debug)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Delivery>>>,
    capacity: usize,
    published: AtomicU64,
    fail_subscribe: AtomicBool,
}

impl InMemoryEventBus {
    /// Create a bus with [`DEFAULT_CAPACITY`] per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with the given per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            fail_subscribe: AtomicBool::new(false),
        }
    }

    /// Make every following `subscribe` call fail.
    pub fn fail_subscriptions(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Deliver a transport error to every current subscriber of `topic`.
    pub fn inject_transport_error(&self, topic: &str, reason: &str) {
        let _ = self.sender(topic).send(Delivery::Fault(reason.to_string()));
    }

    /// Drop the topic's channel; subscribers' streams end once drained.
    pub fn close_topic(&self, topic: &str) {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Total number of messages published through this bus.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Delivery> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        self.published.fetch_add(1, Ordering::SeqCst);
        // No subscribers is not an error: the message is simply never seen.
        let _ = self.sender(topic).send(Delivery::Message(payload.to_vec()));
        Box::pin(async { Ok(()) })
    }

    fn subscribe(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            let err = EventBusError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: "subscriptions disabled".to_string(),
            };
            return Box::pin(async move { Err(err) });
        }

        let mut rx = self.sender(topic).subscribe();
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    match rx.recv().await {
                        Ok(Delivery::Message(bytes)) => yield decode_message(&bytes),
                        Ok(Delivery::Fault(reason)) => yield Err(EventBusError::TransportError(reason)),
                        Err(RecvError::Lagged(skipped)) => {
                            yield Err(EventBusError::TransportError(format!("lagged by {skipped} messages")));
                        },
                        Err(RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

type Hook = Arc<dyn Fn(String, CorrelationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Scripted backend action client.
///
/// Replies are taken from a queue first and fall back to a default reply.
/// An optional async hook runs before each reply, which lets a test publish
/// the completion event "from the backend" while the call is in flight.
pub struct MockActionClient {
    default_reply: Result<ActionOutcome, BackendError>,
    script: Mutex<VecDeque<Result<ActionOutcome, BackendError>>>,
    calls: Mutex<Vec<(String, CorrelationToken)>>,
    hook: Option<Hook>,
    delay: Option<Duration>,
}

impl MockActionClient {
    /// A client that always accepts the action (reply: pending).
    #[must_use]
    pub fn pending() -> Self {
        Self::replying(Ok(ActionOutcome::Pending))
    }

    /// A client that always answers with the given reply.
    #[must_use]
    pub fn replying(reply: Result<ActionOutcome, BackendError>) -> Self {
        Self {
            default_reply: reply,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            hook: None,
            delay: None,
        }
    }

    /// Queue replies to use, in order, before the default one.
    #[must_use]
    pub fn then(self, replies: impl IntoIterator<Item = Result<ActionOutcome, BackendError>>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(replies);
        self
    }

    /// Run `hook(device_id, token)` before every reply.
    #[must_use]
    pub fn with_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, CorrelationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hook = Some(Arc::new(move |device, token| Box::pin(hook(device, token))));
        self
    }

    /// Sleep for `delay` before replying.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every `(device_id, token)` the client was called with.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, CorrelationToken)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl ActionClient for MockActionClient {
    fn start_test_action<'a>(
        &'a self,
        device_id: &'a str,
        token: &'a CorrelationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, BackendError>> + Send + 'a>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device_id.to_string(), token.clone()));
        let reply = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());

        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(hook) = &self.hook {
                hook(device_id.to_string(), token.clone()).await;
            }
            reply
        })
    }
}
