//! Publish/subscribe transport
//!
//! Wraps a [`Broker`] with publish retries, idempotent subscription
//! management and a single outbound stream of received messages.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, IncomingMessage, MessageStream, SubscriptionSink};
use crate::error::{Error, Result};
use crate::message::NotificationMessage;

const INCOMING_BUFFER: usize = 1000;

/// Publish retry policy: `max_attempts` tries, sleeping `attempt * backoff_step`
/// after each failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(100),
        }
    }
}

struct ActiveSubscription {
    sink: Box<dyn SubscriptionSink>,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    cancel: CancellationToken,
    receiver: JoinHandle<()>,
}

impl ActiveSubscription {
    fn is_alive(&self) -> bool {
        !self.receiver.is_finished()
    }
}

struct TransportInner {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    subscription: Mutex<Option<ActiveSubscription>>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: StdMutex<Option<mpsc::Receiver<IncomingMessage>>>,
}

/// Pub/sub transport shared by producers and the dispatcher
///
/// All subscription changes are serialized by one lock. Received messages
/// from every subscription flow into a single stream handed out once by
/// [`PubSubTransport::incoming`].
#[derive(Clone)]
pub struct PubSubTransport {
    inner: Arc<TransportInner>,
}

impl PubSubTransport {
    pub fn new(broker: impl Broker) -> Self {
        Self::from_arc(Arc::new(broker), RetryPolicy::default())
    }

    pub fn with_retry(broker: impl Broker, retry: RetryPolicy) -> Self {
        Self::from_arc(Arc::new(broker), retry)
    }

    pub fn from_arc(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        Self {
            inner: Arc::new(TransportInner {
                broker,
                retry,
                subscription: Mutex::new(None),
                incoming_tx,
                incoming_rx: StdMutex::new(Some(incoming_rx)),
            }),
        }
    }

    /// Return the broker name (for logging)
    pub fn broker_name(&self) -> &'static str {
        self.inner.broker.name()
    }

    /// Validate, serialize and publish a notification
    ///
    /// A publish that reached the broker but whose acknowledgement was lost
    /// can be retried and delivered twice; consumers de-duplicate on `id`.
    pub async fn publish(&self, channel: &str, message: &NotificationMessage) -> Result<()> {
        if channel.is_empty() {
            return Err(Error::EmptyChannel);
        }
        message.validate()?;
        let payload = message.to_json()?;
        self.publish_raw(channel, &payload).await
    }

    /// Publish a pre-serialized payload with the retry policy
    pub async fn publish_raw(&self, channel: &str, payload: &str) -> Result<()> {
        if channel.is_empty() {
            return Err(Error::EmptyChannel);
        }

        let max_attempts = self.inner.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.inner.broker.publish(channel, payload).await {
                Ok(()) => {
                    debug!(channel, attempt, "Published");
                    return Ok(());
                }
                Err(e) => {
                    warn!(channel, attempt, max_attempts, error = %e, "Publish attempt failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.inner.retry.backoff_step * attempt).await;
                    }
                }
            }
        }

        Err(Error::PublishFailed {
            channel: channel.to_string(),
            attempts: max_attempts,
            source: last_error.unwrap_or_else(|| anyhow::anyhow!("no publish attempt made")),
        })
    }

    /// Subscribe to exact channels
    ///
    /// The first call opens the subscription; later calls extend it. Returns
    /// only after the broker confirmed the change.
    pub async fn subscribe<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = collect_names(channels);
        if channels.is_empty() {
            return Err(Error::EmptyChannel);
        }

        let mut guard = self.inner.subscription.lock().await;
        let subscription = self.ensure_open(&mut guard).await?;
        subscription.sink.subscribe(&channels).await.map_err(Error::Subscription)?;
        subscription.sink.ping().await.map_err(Error::Subscription)?;
        info!(channels = ?channels, "Subscribed");
        subscription.channels.extend(channels);
        Ok(())
    }

    /// Subscribe to a wildcard pattern, with the same semantics as `subscribe`
    pub async fn subscribe_pattern(&self, pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            return Err(Error::EmptyChannel);
        }
        let patterns = vec![pattern.to_string()];

        let mut guard = self.inner.subscription.lock().await;
        let subscription = self.ensure_open(&mut guard).await?;
        subscription.sink.psubscribe(&patterns).await.map_err(Error::Subscription)?;
        subscription.sink.ping().await.map_err(Error::Subscription)?;
        info!(pattern, "Pattern subscribed");
        subscription.patterns.extend(patterns);
        Ok(())
    }

    /// Narrow the subscription, or tear it down when `channels` is empty
    ///
    /// Channels that are not currently subscribed are ignored, so repeating
    /// a call has no further effect.
    pub async fn unsubscribe<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = collect_names(channels);
        let mut guard = self.inner.subscription.lock().await;

        if channels.is_empty() {
            if let Some(subscription) = guard.take() {
                close_subscription(subscription).await;
            }
            return Ok(());
        }

        let Some(subscription) = guard.as_mut() else {
            return Ok(());
        };
        let removed: Vec<String> = channels
            .into_iter()
            .filter(|c| subscription.channels.contains(c))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        subscription.sink.unsubscribe(&removed).await.map_err(Error::Subscription)?;
        for channel in &removed {
            subscription.channels.remove(channel);
        }
        info!(channels = ?removed, "Unsubscribed");
        Ok(())
    }

    /// Drop a pattern subscription; unknown patterns are ignored
    pub async fn unsubscribe_pattern(&self, pattern: &str) -> Result<()> {
        let mut guard = self.inner.subscription.lock().await;
        let Some(subscription) = guard.as_mut() else {
            return Ok(());
        };
        if !subscription.patterns.contains(pattern) {
            return Ok(());
        }
        let patterns = vec![pattern.to_string()];
        subscription.sink.punsubscribe(&patterns).await.map_err(Error::Subscription)?;
        subscription.patterns.remove(pattern);
        info!(pattern, "Pattern unsubscribed");
        Ok(())
    }

    /// Full teardown; equivalent to `unsubscribe` with no channels
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.unsubscribe(std::iter::empty::<String>()).await
    }

    /// Whether a subscription is open and its receiver is running
    pub async fn is_active(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveSubscription::is_alive)
    }

    /// Currently subscribed channels, sorted
    pub async fn subscribed_channels(&self) -> Vec<String> {
        let guard = self.inner.subscription.lock().await;
        let mut channels: Vec<String> = guard
            .as_ref()
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Currently subscribed patterns, sorted
    pub async fn subscribed_patterns(&self) -> Vec<String> {
        let guard = self.inner.subscription.lock().await;
        let mut patterns: Vec<String> = guard
            .as_ref()
            .map(|s| s.patterns.iter().cloned().collect())
            .unwrap_or_default();
        patterns.sort();
        patterns
    }

    /// Take the stream of received messages. Only one consumer may hold it.
    pub fn incoming(&self) -> Result<mpsc::Receiver<IncomingMessage>> {
        self.inner
            .incoming_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::StreamTaken)
    }

    async fn ensure_open<'a>(
        &self,
        slot: &'a mut Option<ActiveSubscription>,
    ) -> Result<&'a mut ActiveSubscription> {
        let subscription = match slot.take() {
            Some(subscription) if subscription.is_alive() => subscription,
            Some(stale) => {
                warn!(broker = self.broker_name(), "Subscription stream ended, reopening");
                let (channels, patterns) = (stale.channels.clone(), stale.patterns.clone());
                close_subscription(stale).await;
                self.open(channels, patterns).await?
            }
            None => self.open(HashSet::new(), HashSet::new()).await?,
        };
        Ok(slot.insert(subscription))
    }

    async fn open(
        &self,
        channels: HashSet<String>,
        patterns: HashSet<String>,
    ) -> Result<ActiveSubscription> {
        let (mut sink, stream) = self
            .inner
            .broker
            .open_subscription()
            .await
            .map_err(Error::Subscription)?;

        if !channels.is_empty() {
            let names: Vec<String> = channels.iter().cloned().collect();
            sink.subscribe(&names).await.map_err(Error::Subscription)?;
        }
        if !patterns.is_empty() {
            let names: Vec<String> = patterns.iter().cloned().collect();
            sink.psubscribe(&names).await.map_err(Error::Subscription)?;
        }

        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(
            stream,
            self.inner.incoming_tx.clone(),
            cancel.clone(),
        ));

        info!(broker = self.broker_name(), "Subscription opened");
        Ok(ActiveSubscription {
            sink,
            channels,
            patterns,
            cancel,
            receiver,
        })
    }
}

fn collect_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .filter(|name: &String| !name.is_empty())
        .collect()
}

async fn close_subscription(subscription: ActiveSubscription) {
    let ActiveSubscription {
        sink,
        cancel,
        receiver,
        ..
    } = subscription;
    cancel.cancel();
    drop(sink);
    let _ = receiver.await;
    info!("Subscription closed");
}

async fn receive_loop(
    mut stream: MessageStream,
    incoming: mpsc::Sender<IncomingMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => match msg {
                Some(msg) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = incoming.send(msg) => {
                            if sent.is_err() {
                                debug!("Incoming consumer gone, stopping receiver");
                                break;
                            }
                        }
                    }
                }
                None => {
                    warn!("Broker stream ended");
                    break;
                }
            }
        }
    }
}
