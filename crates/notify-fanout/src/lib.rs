//! # Notify Fanout
//!
//! Real-time notification fan-out: a pub/sub bus carries notifications
//! between stateless gateway instances, and each instance delivers them to
//! its locally connected WebSocket clients.
//!
//! ## Features
//!
//! - **Channel Routing**: user, role and system channels under an optional deployment prefix
//! - **Pluggable Brokers**: Implement `Broker` to publish and subscribe through any backend
//! - **Publish Retries**: Bounded retries with linear backoff, failures surfaced to the caller
//! - **Worker Pool Dispatch**: Exact and wildcard handlers fed by a bounded queue
//! - **Slow-Consumer Drop**: Broadcasts never block; a full client buffer drops that client
//! - **Built-in Server**: Optional Axum-based WebSocket endpoint with health and metrics routes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notify_fanout::{Gateway, MemoryBroker};
//! use notify_fanout::auth::trusted_headers;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Gateway::builder()
//!         .port(8080)
//!         .broker(MemoryBroker::new())
//!         .channel_prefix("app")
//!         .identity_resolver(trusted_headers())
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```
//!
//! ## Publishing
//!
//! ```rust,ignore
//! use notify_fanout::{ChannelRouter, NotificationMessage, PubSubTransport};
//!
//! let router = ChannelRouter::with_prefix("app");
//! let transport = PubSubTransport::new(broker);
//! let message = NotificationMessage::new("42", "order_shipped", "Shipped", "Your order is on its way");
//! transport.publish(&router.user_channel("42"), &message).await?;
//! ```
//!
//! ## Custom Broker
//!
//! ```rust,ignore
//! use notify_fanout::{async_trait, Broker, MessageStream, SubscriptionSink};
//!
//! struct MyBroker;
//!
//! #[async_trait]
//! impl Broker for MyBroker {
//!     async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
//!         // Send the payload to your backend
//!         Ok(())
//!     }
//!
//!     async fn open_subscription(&self) -> anyhow::Result<(Box<dyn SubscriptionSink>, MessageStream)> {
//!         // Return a control handle and the stream of received messages
//!         todo!()
//!     }
//!
//!     fn name(&self) -> &'static str { "MyBroker" }
//! }
//! ```

pub mod broker;
pub mod channel;
mod connection;
pub mod dispatcher;
mod error;
mod fanout;
mod manager;
mod message;
mod metrics;
pub mod transport;

#[cfg(feature = "server")]
pub mod auth;
#[cfg(feature = "server")]
mod gateway;
#[cfg(feature = "server")]
pub mod handler;

// Re-exports
pub use broker::{glob_match, Broker, IncomingMessage, MemoryBroker, MessageStream, SubscriptionSink};
pub use channel::{ChannelRouter, ChannelScope, ParsedChannel, NAMESPACE};
pub use connection::{Connection, ConnectionHandle, ConnectionMetadata, Payload};
pub use dispatcher::{handler_fn, DispatchStats, HandlerFn, MessageDispatcher, PatternMatcher, PrefixMatcher};
pub use error::{ChannelError, Error, Result, ValidationError};
pub use fanout::fan_out_handler;
pub use manager::{ConnectionManager, ManagerConfig};
pub use message::{NotificationData, NotificationMessage};
pub use metrics::MetricsSnapshot;
pub use transport::{PubSubTransport, RetryPolicy};

#[cfg(feature = "server")]
pub use gateway::{shutdown_signal, Gateway, GatewayBuilder, GatewayLimits};

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
