//! Broker abstraction
//!
//! Implement `Broker` to plug a pub/sub backend into `PubSubTransport`.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::message::NotificationMessage;

/// Message received from a broker subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Channel the message was published on
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
    /// Raw payload as published
    pub payload: String,
}

impl IncomingMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            pattern: None,
            payload: payload.into(),
        }
    }

    /// Set the matching pattern
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Decode the payload as a notification
    pub fn notification(&self) -> serde_json::Result<NotificationMessage> {
        NotificationMessage::from_json(&self.payload)
    }
}

/// Stream of messages delivered on an open subscription
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// Trait for pub/sub brokers
///
/// # Example
///
/// ```rust,ignore
/// use notify_fanout::{Broker, MessageStream, SubscriptionSink};
/// use async_trait::async_trait;
///
/// struct MyBroker;
///
/// #[async_trait]
/// impl Broker for MyBroker {
///     async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
///         my_client::publish(channel, payload).await
///     }
///
///     async fn open_subscription(&self) -> anyhow::Result<(Box<dyn SubscriptionSink>, MessageStream)> {
///         my_client::subscriber().await
///     }
///
///     fn name(&self) -> &'static str { "MyBroker" }
/// }
/// ```
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish a payload once; retries are the caller's concern
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;

    /// Open a dedicated subscription connection.
    ///
    /// Dropping both halves closes the subscription.
    async fn open_subscription(
        &self,
    ) -> anyhow::Result<(Box<dyn SubscriptionSink>, MessageStream)>;

    /// Return the broker name (for logging)
    fn name(&self) -> &'static str;
}

/// Control half of an open subscription
#[async_trait]
pub trait SubscriptionSink: Send + 'static {
    async fn subscribe(&mut self, channels: &[String]) -> anyhow::Result<()>;

    async fn psubscribe(&mut self, patterns: &[String]) -> anyhow::Result<()>;

    async fn unsubscribe(&mut self, channels: &[String]) -> anyhow::Result<()>;

    async fn punsubscribe(&mut self, patterns: &[String]) -> anyhow::Result<()>;

    /// Round-trip to the broker, confirming earlier commands were applied
    async fn ping(&mut self) -> anyhow::Result<()>;
}

/// Redis-style glob match supporting `*` and `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(c) if *c == '?' || *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

struct MemorySubscriber {
    channels: HashSet<String>,
    patterns: HashSet<String>,
    sender: mpsc::UnboundedSender<IncomingMessage>,
}

#[derive(Default)]
struct MemoryBrokerInner {
    subscribers: DashMap<u64, MemorySubscriber>,
    next_id: AtomicU64,
    published: AtomicU64,
}

/// In-process broker for tests and local development
///
/// Delivers each publish at most once per subscription: an exact channel
/// subscription takes precedence over pattern subscriptions.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful publishes
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            let message = if subscriber.channels.contains(channel) {
                Some(IncomingMessage::new(channel, payload))
            } else {
                subscriber
                    .patterns
                    .iter()
                    .find(|pattern| glob_match(pattern, channel))
                    .map(|pattern| IncomingMessage::new(channel, payload).with_pattern(pattern.clone()))
            };
            if let Some(message) = message {
                let _ = subscriber.sender.send(message);
            }
        }
        Ok(())
    }

    async fn open_subscription(
        &self,
    ) -> anyhow::Result<(Box<dyn SubscriptionSink>, MessageStream)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(
            id,
            MemorySubscriber {
                channels: HashSet::new(),
                patterns: HashSet::new(),
                sender,
            },
        );
        let sink = MemorySink {
            id,
            broker: self.inner.clone(),
        };
        Ok((Box::new(sink), Box::pin(UnboundedReceiverStream::new(receiver))))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

struct MemorySink {
    id: u64,
    broker: Arc<MemoryBrokerInner>,
}

impl MemorySink {
    fn update(&self, apply: impl FnOnce(&mut MemorySubscriber)) -> anyhow::Result<()> {
        let mut subscriber = self
            .broker
            .subscribers
            .get_mut(&self.id)
            .ok_or_else(|| anyhow::anyhow!("subscription {} is closed", self.id))?;
        apply(&mut subscriber);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionSink for MemorySink {
    async fn subscribe(&mut self, channels: &[String]) -> anyhow::Result<()> {
        self.update(|s| s.channels.extend(channels.iter().cloned()))
    }

    async fn psubscribe(&mut self, patterns: &[String]) -> anyhow::Result<()> {
        self.update(|s| s.patterns.extend(patterns.iter().cloned()))
    }

    async fn unsubscribe(&mut self, channels: &[String]) -> anyhow::Result<()> {
        self.update(|s| channels.iter().for_each(|c| {
            s.channels.remove(c);
        }))
    }

    async fn punsubscribe(&mut self, patterns: &[String]) -> anyhow::Result<()> {
        self.update(|s| patterns.iter().for_each(|p| {
            s.patterns.remove(p);
        }))
    }

    async fn ping(&mut self) -> anyhow::Result<()> {
        self.update(|_| {})
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.broker.subscribers.remove(&self.id);
    }
}
