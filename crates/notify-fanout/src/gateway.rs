//! Gateway builder and runner

use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::HeaderValue, middleware, routing::get, Router};
use governor::Quota;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::auth::{resolve_identity, IdentityFn, IdentityRequest, IdentityResponse};
use crate::broker::Broker;
use crate::channel::ChannelRouter;
use crate::dispatcher::{HandlerFn, MessageDispatcher, DEFAULT_WORKER_POOL_SIZE};
use crate::error::{Error, Result};
use crate::fanout::fan_out_handler;
use crate::handler::{self, GatewayState};
use crate::manager::{ConnectionManager, ManagerConfig};
use crate::transport::{PubSubTransport, RetryPolicy};

/// Floor for the ping interval and the read/write deadlines
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

const PROTOCOL_LIMIT_FACTOR: usize = 16;
const MIN_PROTOCOL_LIMIT: usize = 64 * 1024;

/// Per-connection limits applied by the WebSocket endpoint
#[derive(Debug, Clone)]
pub struct GatewayLimits {
    /// Accepted `Origin` values; empty or `*` accepts any origin
    pub allowed_origins: Vec<String>,
    pub max_message_size: usize,
    pub rate_limit_per_second: u32,
    pub rate_limit_burst: u32,
    pub write_timeout: Duration,
    /// Read deadline, renewed by every inbound frame
    pub pong_timeout: Duration,
    pub ping_interval: Duration,
    /// Outbound buffer capacity per connection
    pub buffer_capacity: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        let pong_timeout = Duration::from_secs(60);
        Self {
            allowed_origins: Vec::new(),
            max_message_size: 512,
            rate_limit_per_second: 10,
            rate_limit_burst: 20,
            write_timeout: Duration::from_secs(10),
            pong_timeout,
            ping_interval: pong_timeout * 9 / 10,
            buffer_capacity: 256,
        }
    }
}

impl GatewayLimits {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// are accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allows_any_origin() => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin)),
        }
    }

    /// Copy of these limits with every interval and timeout raised to at
    /// least `MIN_INTERVAL`, so a zero setting cannot stall or panic a pump
    pub fn normalized(mut self) -> Self {
        self.write_timeout = self.write_timeout.max(MIN_INTERVAL);
        self.pong_timeout = self.pong_timeout.max(MIN_INTERVAL);
        self.ping_interval = self.ping_interval.max(MIN_INTERVAL);
        self
    }

    /// Hard ceiling handed to the WebSocket protocol layer.
    ///
    /// Kept above `max_message_size` so oversized frames reach the read pump
    /// and are closed with 1009 instead of failing inside the codec.
    pub(crate) fn protocol_frame_limit(&self) -> usize {
        self.max_message_size
            .saturating_mul(PROTOCOL_LIMIT_FACTOR)
            .max(MIN_PROTOCOL_LIMIT)
    }

    pub(crate) fn quota(&self) -> Quota {
        let rate = NonZeroU32::new(self.rate_limit_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.rate_limit_burst).unwrap_or(rate);
        Quota::per_second(rate).allow_burst(burst)
    }
}

/// Gateway configuration and runner
pub struct Gateway {
    port: u16,
    router: ChannelRouter,
    transport: PubSubTransport,
    dispatcher: MessageDispatcher,
    connection_manager: ConnectionManager,
    limits: Arc<GatewayLimits>,
    identity: Option<IdentityFn>,
    worker_pool_size: usize,
    shutdown_timeout: Duration,
    channels: Vec<String>,
    patterns: Vec<String>,
    draining: CancellationToken,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection_manager
    }

    pub fn transport(&self) -> &PubSubTransport {
        &self.transport
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    pub fn channel_router(&self) -> &ChannelRouter {
        &self.router
    }

    pub fn limits(&self) -> &GatewayLimits {
        &self.limits
    }

    /// Whether shutdown has begun and upgrades are refused
    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// HTTP routes: `/ws`, `/health`, `/ready`, `/metrics`
    pub fn router(&self) -> Router {
        let state = GatewayState {
            connection_manager: self.connection_manager.clone(),
            transport: self.transport.clone(),
            limits: self.limits.clone(),
            draining: self.draining.clone(),
        };

        let ws = match &self.identity {
            Some(resolver) => get(handler::ws_connect)
                .route_layer(middleware::from_fn_with_state(resolver.clone(), resolve_identity)),
            None => get(handler::ws_connect),
        };

        Router::new()
            .route("/ws", ws)
            .route("/health", get(handler::health))
            .route("/ready", get(handler::ready))
            .route("/metrics", get(handler::metrics))
            .layer(cors_layer(&self.limits))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Subscribe to the configured channels and patterns, then start the
    /// dispatcher. Fails without starting anything if the broker rejects a
    /// subscription.
    pub async fn start(&self) -> Result<()> {
        if !self.channels.is_empty() {
            self.transport.subscribe(self.channels.iter().cloned()).await?;
        }
        for pattern in &self.patterns {
            self.transport.subscribe_pattern(pattern).await?;
        }
        self.dispatcher.start(self.worker_pool_size).await?;

        info!(
            broker = self.transport.broker_name(),
            instance_id = self.connection_manager.instance_id(),
            channels = ?self.channels,
            patterns = ?self.patterns,
            handlers = self.dispatcher.handler_count(),
            "Gateway started"
        );
        Ok(())
    }

    /// Bind the configured port and serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        self.run_until(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then shut down in order
    pub async fn run_until<F>(&self, listener: TcpListener, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start().await?;

        let addr = listener.local_addr()?;
        info!(%addr, "Listening");

        let app = self.router();
        let draining = self.draining.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(draining.cancelled_owned())
                .await
        });

        signal.await;
        info!("Shutdown signal received");

        let deadline = Instant::now() + self.shutdown_timeout;
        let result = self.shutdown_until(deadline).await;
        match tokio::time::timeout_at(deadline, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
            Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
            Err(_) => warn!("HTTP server did not stop in time"),
        }
        result?;

        info!("Gateway shutdown complete");
        Ok(())
    }

    /// Stop accepting upgrades, close every connection, drain the dispatcher
    /// and drop all subscriptions, bounded by the shutdown timeout
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_until(Instant::now() + self.shutdown_timeout).await
    }

    async fn shutdown_until(&self, deadline: Instant) -> Result<()> {
        let sequence = async {
            self.draining.cancel();
            self.connection_manager.stop().await;
            self.dispatcher.shutdown().await;
            if let Err(e) = self.transport.unsubscribe_all().await {
                warn!(error = %e, "Failed to drop subscriptions");
            }
        };

        tokio::time::timeout_at(deadline, sequence)
            .await
            .map_err(|_| {
                error!(timeout = ?self.shutdown_timeout, "Shutdown timed out, abandoning remaining work");
                Error::ShutdownTimeout(self.shutdown_timeout)
            })
    }
}

fn cors_layer(limits: &GatewayLimits) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if limits.allows_any_origin() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = limits
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    layer.allow_origin(origins)
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Builder for Gateway
pub struct GatewayBuilder {
    port: u16,
    broker: Option<Arc<dyn Broker>>,
    router: ChannelRouter,
    instance_id: Option<String>,
    limits: GatewayLimits,
    manager_config: ManagerConfig,
    retry: RetryPolicy,
    worker_pool_size: usize,
    shutdown_timeout: Duration,
    identity: Option<IdentityFn>,
    channels: Vec<String>,
    patterns: Vec<String>,
    handlers: Vec<(String, HandlerFn)>,
    default_routes: bool,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            port: 8080,
            broker: None,
            router: ChannelRouter::new(),
            instance_id: None,
            limits: GatewayLimits::default(),
            manager_config: ManagerConfig::default(),
            retry: RetryPolicy::default(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            shutdown_timeout: Duration::from_secs(30),
            identity: None,
            channels: Vec::new(),
            patterns: Vec::new(),
            handlers: Vec::new(),
            default_routes: true,
        }
    }
}

impl GatewayBuilder {
    /// Set the server port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the pub/sub broker
    pub fn broker(mut self, broker: impl Broker) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Use a channel prefix for every channel name
    pub fn channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.router = ChannelRouter::with_prefix(prefix);
        self
    }

    pub fn channel_router(mut self, router: ChannelRouter) -> Self {
        self.router = router;
        self
    }

    /// Set the instance ID
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn limits(mut self, limits: GatewayLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager_config = config;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the identity callback run before every upgrade
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use notify_fanout::Gateway;
    /// use notify_fanout::auth::{deny, ClientIdentity, IdentityRequest};
    /// use axum::http::StatusCode;
    ///
    /// Gateway::builder()
    ///     .broker(broker)
    ///     .identity(|req: IdentityRequest| async move {
    ///         match req.bearer_token() {
    ///             Some(token) => lookup(token).await,
    ///             None => Err(deny(StatusCode::UNAUTHORIZED, "Token required")),
    ///         }
    ///     })
    ///     .build()?
    ///     .run()
    ///     .await
    /// ```
    pub fn identity<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(IdentityRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IdentityResponse> + Send + 'static,
    {
        self.identity = Some(crate::auth::identity_fn(f));
        self
    }

    pub fn identity_resolver(mut self, resolver: IdentityFn) -> Self {
        self.identity = Some(resolver);
        self
    }

    /// Subscribe to an exact channel on start
    pub fn subscribe(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    /// Subscribe to a wildcard pattern on start
    pub fn subscribe_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Register a dispatcher handler; replaces the default routes for the
    /// same pattern
    pub fn handler(mut self, pattern: impl Into<String>, handler: HandlerFn) -> Self {
        self.handlers.push((pattern.into(), handler));
        self
    }

    /// Enable or disable routing of user, role and system channels to
    /// connections
    pub fn default_routes(mut self, enable: bool) -> Self {
        self.default_routes = enable;
        self
    }

    /// Build the gateway. Must be called inside a Tokio runtime.
    ///
    /// Without explicit subscriptions the gateway subscribes to the router's
    /// wildcard pattern.
    pub fn build(self) -> Result<Gateway> {
        let broker = self
            .broker
            .ok_or_else(|| Error::Config("broker is required".to_string()))?;
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let transport = PubSubTransport::from_arc(broker, self.retry);
        let dispatcher = MessageDispatcher::new(transport.clone());
        let connection_manager = ConnectionManager::with_config(instance_id, self.manager_config);

        if self.default_routes {
            dispatcher.register_handler(
                self.router.wildcard_pattern(),
                fan_out_handler(self.router.clone(), connection_manager.clone()),
            );
        }
        for (pattern, handler) in self.handlers {
            dispatcher.register_handler(pattern, handler);
        }

        let mut patterns = self.patterns;
        if self.channels.is_empty() && patterns.is_empty() {
            patterns.push(self.router.wildcard_pattern());
        }

        if self.identity.is_some() {
            info!("Identity check enabled for WebSocket upgrades");
        } else {
            warn!("No identity resolver configured, every upgrade will be rejected");
        }

        Ok(Gateway {
            port: self.port,
            router: self.router,
            transport,
            dispatcher,
            connection_manager,
            limits: Arc::new(self.limits.normalized()),
            identity: self.identity,
            worker_pool_size: self.worker_pool_size,
            shutdown_timeout: self.shutdown_timeout,
            channels: self.channels,
            patterns,
            draining: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_allow_list() {
        let limits = GatewayLimits {
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..GatewayLimits::default()
        };
        assert!(limits.origin_allowed(None));
        assert!(limits.origin_allowed(Some("https://app.example.com")));
        assert!(!limits.origin_allowed(Some("https://evil.example.com")));

        let open = GatewayLimits::default();
        assert!(open.origin_allowed(Some("https://anything.example.com")));
    }

    #[test]
    fn test_default_ping_interval_is_below_pong_timeout() {
        let limits = GatewayLimits::default();
        assert_eq!(limits.ping_interval, Duration::from_secs(54));
        assert!(limits.ping_interval < limits.pong_timeout);
    }

    #[test]
    fn test_normalized_raises_zero_intervals() {
        let limits = GatewayLimits {
            write_timeout: Duration::ZERO,
            pong_timeout: Duration::ZERO,
            ping_interval: Duration::ZERO,
            ..GatewayLimits::default()
        }
        .normalized();
        assert_eq!(limits.write_timeout, MIN_INTERVAL);
        assert_eq!(limits.pong_timeout, MIN_INTERVAL);
        assert_eq!(limits.ping_interval, MIN_INTERVAL);

        let defaults = GatewayLimits::default().normalized();
        assert_eq!(defaults.ping_interval, Duration::from_secs(54));
    }

    #[test]
    fn test_protocol_limit_stays_above_message_limit() {
        let small = GatewayLimits {
            max_message_size: 64,
            ..GatewayLimits::default()
        };
        assert_eq!(small.protocol_frame_limit(), 64 * 1024);

        let large = GatewayLimits {
            max_message_size: 1024 * 1024,
            ..GatewayLimits::default()
        };
        assert_eq!(large.protocol_frame_limit(), 16 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_build_requires_broker() {
        assert!(matches!(Gateway::builder().build(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_build_defaults_to_wildcard_subscription() {
        let gateway = Gateway::builder()
            .broker(crate::broker::MemoryBroker::new())
            .channel_prefix("app")
            .build()
            .unwrap();
        assert_eq!(gateway.patterns, vec!["app:notifications:*".to_string()]);
        assert_eq!(gateway.dispatcher().handler_count(), 1);
    }
}
