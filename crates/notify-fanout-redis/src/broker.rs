//! Redis Pub/Sub broker

use async_trait::async_trait;
use notify_fanout::{Broker, IncomingMessage, MessageStream, SubscriptionSink};
use redis::aio::{ConnectionManager, PubSubSink};
use tokio_stream::StreamExt;
use tracing::{info, warn};

/// Redis Pub/Sub broker
///
/// Publishes go through a shared auto-reconnecting connection; every
/// subscription opens its own dedicated Pub/Sub connection.
///
/// # Example
///
/// ```rust,ignore
/// use notify_fanout::Gateway;
/// use notify_fanout_redis::RedisBroker;
///
/// Gateway::builder()
///     .broker(RedisBroker::connect("redis://localhost:6379").await?)
///     .channel_prefix("app")
///     .build()?
///     .run()
///     .await
/// ```
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBroker {
    /// Connect to Redis and verify the connection
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut publisher = ConnectionManager::new(client.clone()).await?;
        redis::cmd("PING").query_async::<String>(&mut publisher).await?;
        info!(url = %redact(redis_url), "Connected to Redis");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn open_subscription(&self) -> anyhow::Result<(Box<dyn SubscriptionSink>, MessageStream)> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();

        let stream = stream.filter_map(|msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel = msg.get_channel_name(), error = %e, "Dropping non-text payload");
                    return None;
                }
            };
            let incoming = IncomingMessage::new(msg.get_channel_name(), payload);
            match msg.get_pattern::<Option<String>>() {
                Ok(Some(pattern)) => Some(incoming.with_pattern(pattern)),
                _ => Some(incoming),
            }
        });

        Ok((Box::new(RedisSubscriptionSink { sink }), Box::pin(stream)))
    }

    fn name(&self) -> &'static str {
        "Redis Pub/Sub"
    }
}

/// Control half of a Redis Pub/Sub connection
pub struct RedisSubscriptionSink {
    sink: PubSubSink,
}

#[async_trait]
impl SubscriptionSink for RedisSubscriptionSink {
    async fn subscribe(&mut self, channels: &[String]) -> anyhow::Result<()> {
        self.sink.subscribe(channels).await?;
        Ok(())
    }

    async fn psubscribe(&mut self, patterns: &[String]) -> anyhow::Result<()> {
        self.sink.psubscribe(patterns).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, channels: &[String]) -> anyhow::Result<()> {
        self.sink.unsubscribe(channels).await?;
        Ok(())
    }

    async fn punsubscribe(&mut self, patterns: &[String]) -> anyhow::Result<()> {
        self.sink.punsubscribe(patterns).await?;
        Ok(())
    }

    async fn ping(&mut self) -> anyhow::Result<()> {
        self.sink.ping::<redis::Value>().await?;
        Ok(())
    }
}

/// Strip credentials from a Redis URL before logging it
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_credentials() {
        assert_eq!(redact("redis://:secret@cache:6379/0"), "redis://***@cache:6379/0");
        assert_eq!(redact("rediss://user:pw@host"), "rediss://***@host");
        assert_eq!(redact("redis://localhost:6379"), "redis://localhost:6379");
    }
}
