//! Message dispatcher
//!
//! A receiver task drains the transport into a bounded queue; a fixed pool
//! of workers pulls from the queue and invokes the handler registered for
//! each message's channel.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::IncomingMessage;
use crate::error::{Error, Result};
use crate::transport::PubSubTransport;

/// Capacity of the queue between the receiver and the workers
pub const QUEUE_CAPACITY: usize = 100;

/// Worker count used when `start` is given zero
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

/// Future returned by a message handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Message handler callback type
pub type HandlerFn = Arc<dyn Fn(IncomingMessage) -> HandlerFuture + Send + Sync>;

/// Helper to create a handler from an async closure
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Decides which registered patterns are wildcards and what they match
pub trait PatternMatcher: Send + Sync + 'static {
    fn is_wildcard(&self, pattern: &str) -> bool;

    fn matches(&self, pattern: &str, channel: &str) -> bool;
}

/// `prefix*` matches every channel starting with `prefix`
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixMatcher;

impl PatternMatcher for PrefixMatcher {
    fn is_wildcard(&self, pattern: &str) -> bool {
        pattern.ends_with('*')
    }

    fn matches(&self, pattern: &str, channel: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => pattern == channel,
        }
    }
}

/// Dispatch outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub handled: u64,
    pub failed: u64,
    /// Messages no pattern matched (dead letters)
    pub unroutable: u64,
}

#[derive(Default)]
struct Counters {
    handled: AtomicU64,
    failed: AtomicU64,
    unroutable: AtomicU64,
}

struct DispatcherInner {
    transport: PubSubTransport,
    handlers: RwLock<HashMap<String, HandlerFn>>,
    matcher: Box<dyn PatternMatcher>,
    cancel: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
    counters: Counters,
}

/// Routes transport messages to registered handlers
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

impl MessageDispatcher {
    pub fn new(transport: PubSubTransport) -> Self {
        Self::with_matcher(transport, PrefixMatcher)
    }

    pub fn with_matcher(transport: PubSubTransport, matcher: impl PatternMatcher) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                handlers: RwLock::new(HashMap::new()),
                matcher: Box::new(matcher),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Register a handler for an exact channel or a `prefix*` pattern.
    /// Re-registering a pattern replaces its handler.
    pub fn register_handler(&self, pattern: impl Into<String>, handler: HandlerFn) {
        let pattern = pattern.into();
        debug!(pattern = %pattern, "Handler registered");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern, handler);
    }

    pub fn unregister_handler(&self, pattern: &str) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pattern)
            .is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn stats(&self) -> DispatchStats {
        let counters = &self.inner.counters;
        DispatchStats {
            handled: counters.handled.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            unroutable: counters.unroutable.load(Ordering::Relaxed),
        }
    }

    /// Messages dropped because no handler matched
    pub fn unroutable_count(&self) -> u64 {
        self.inner.counters.unroutable.load(Ordering::Relaxed)
    }

    /// Start the receiver task and `worker_pool_size` workers
    /// (`DEFAULT_WORKER_POOL_SIZE` when zero).
    pub async fn start(&self, worker_pool_size: usize) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.is_some() || self.inner.cancel.is_cancelled() {
            return Err(Error::AlreadyStarted);
        }

        let incoming = self.inner.transport.incoming()?;
        let workers = if worker_pool_size == 0 {
            DEFAULT_WORKER_POOL_SIZE
        } else {
            worker_pool_size
        };

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let mut set = JoinSet::new();

        set.spawn(receive(incoming, queue_tx, self.inner.cancel.clone()));
        for worker_id in 0..workers {
            set.spawn(work(worker_id, queue_rx.clone(), self.inner.clone()));
        }

        *tasks = Some(set);
        info!(workers, queue_capacity = QUEUE_CAPACITY, "Dispatcher started");
        Ok(())
    }

    /// Stop receiving, let workers drain the queue and wait for every task
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let Some(mut set) = self.inner.tasks.lock().await.take() else {
            return;
        };
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher task failed");
            }
        }
        let stats = self.stats();
        info!(
            handled = stats.handled,
            failed = stats.failed,
            unroutable = stats.unroutable,
            "Dispatcher stopped"
        );
    }
}

impl DispatcherInner {
    /// Exact match first, then the wildcard with the longest prefix
    fn resolve(&self, channel: &str) -> Option<(String, HandlerFn)> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = handlers.get(channel) {
            return Some((channel.to_string(), handler.clone()));
        }
        handlers
            .iter()
            .filter(|(pattern, _)| {
                self.matcher.is_wildcard(pattern) && self.matcher.matches(pattern, channel)
            })
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(pattern, handler)| (pattern.clone(), handler.clone()))
    }

    async fn dispatch(&self, msg: IncomingMessage) {
        let Some((pattern, handler)) = self.resolve(&msg.channel) else {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %msg.channel, "No handler for channel, dropping message");
            return;
        };

        let channel = msg.channel.clone();
        match AssertUnwindSafe(handler(msg)).catch_unwind().await {
            Ok(Ok(())) => {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %channel, pattern = %pattern, "Message handled");
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(channel = %channel, pattern = %pattern, error = %e, "Handler failed, dropping message");
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(channel = %channel, pattern = %pattern, "Handler panicked, dropping message");
            }
        }
    }
}

async fn receive(
    mut incoming: mpsc::Receiver<IncomingMessage>,
    queue: mpsc::Sender<IncomingMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = incoming.recv() => {
                let Some(msg) = msg else { break };
                let channel = msg.channel.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(channel = %channel, "Dispatcher stopping, message not queued");
                        break;
                    }
                    sent = queue.send(msg) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    // Dropping `queue` closes it; workers drain what is left and exit.
    debug!("Dispatcher receiver stopped");
}

async fn work(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<IncomingMessage>>>,
    inner: Arc<DispatcherInner>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(msg) = next else { break };
        inner.dispatch(msg).await;
    }
    debug!(worker_id, "Dispatcher worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matcher() {
        let m = PrefixMatcher;
        assert!(m.is_wildcard("notifications:*"));
        assert!(!m.is_wildcard("notifications:system"));
        assert!(m.matches("notifications:user:*", "notifications:user:42"));
        assert!(m.matches("*", "anything"));
        assert!(!m.matches("notifications:role:*", "notifications:user:42"));
        assert!(m.matches("notifications:system", "notifications:system"));
    }
}
