//! Event publish/subscribe facility handed to modules.
//!
//! The kernel only passes the bus through module contexts and drains it on
//! close. [`LocalEventBus`] is an in-process implementation over per-topic
//! broadcast channels; a slow subscriber lags and loses the oldest events
//! instead of blocking publishers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, trace};

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

/// Publish/subscribe contract.
pub trait EventBus: Send + Sync {
    /// Publish `payload` on `topic`; returns how many subscribers received it.
    fn publish(&self, topic: &str, payload: serde_json::Value) -> usize;

    /// Subscribe to events published on `topic` from now on.
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Stop accepting events and wait up to `timeout` for subscribers to
    /// drain. Returns `false` if undelivered events remained.
    fn shutdown(&self, timeout: Duration) -> bool;
}

/// Receiving end of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(topic = %self.topic, skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(topic = %self.topic, skipped, "subscriber lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// In-process event bus.
#[derive(Debug)]
pub struct LocalEventBus {
    capacity: usize,
    topics: DashMap<String, broadcast::Sender<Event>>,
    closed: AtomicBool,
    log_publishes: bool,
}

impl LocalEventBus {
    /// Bus whose topics buffer up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: DashMap::new(),
            closed: AtomicBool::new(false),
            log_publishes: false,
        }
    }

    /// Log every publish at info level.
    #[must_use]
    pub fn with_publish_logging(mut self, enabled: bool) -> Self {
        self.log_publishes = enabled;
        self
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        if let Some(sender) = self.topics.get(topic) {
            return sender.clone();
        }
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn pending(&self) -> usize {
        self.topics.iter().map(|sender| sender.len()).sum()
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            trace!(topic, "publish after shutdown dropped");
            return 0;
        }
        let Some(sender) = self.topics.get(topic).map(|s| s.clone()) else {
            return 0;
        };
        let event = Event {
            topic: topic.to_string(),
            payload,
            published_at: Utc::now(),
        };
        let delivered = sender.send(event).unwrap_or(0);
        if self.log_publishes {
            info!(topic, delivered, "event published");
        }
        delivered
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let receiver = if self.closed.load(Ordering::SeqCst) {
            // a receiver whose sender is already gone reports Closed at once
            broadcast::channel(1).0.subscribe()
        } else {
            self.sender(topic).subscribe()
        };
        Subscription {
            topic: topic.to_string(),
            receiver,
        }
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return self.topics.is_empty();
        }

        let deadline = Instant::now() + timeout;
        let mut drained = self.pending() == 0;
        while !drained && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            drained = self.pending() == 0;
        }
        if !drained {
            debug!(pending = self.pending(), "event bus closed with undelivered events");
        }

        self.topics.clear();
        drained
    }
}
