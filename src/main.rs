mod config;

use notify_fanout::auth::trusted_headers;
use notify_fanout::Gateway;
use notify_fanout_redis::RedisBroker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // redis and rustls both pull in crypto backends; pick one explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::load()?;

    tracing::info!(
        instance_id = %config.server.instance_id,
        port = config.server.port,
        channel_prefix = ?config.channels.prefix,
        workers = config.gateway.worker_pool_size,
        trust_identity_headers = config.server.trust_identity_headers,
        "Gateway starting"
    );

    let broker = RedisBroker::connect(&config.redis.url).await?;

    let mut builder = Gateway::builder()
        .port(config.server.port)
        .instance_id(config.server.instance_id.clone())
        .broker(broker)
        .limits(config.gateway.limits())
        .worker_pool_size(config.gateway.worker_pool_size)
        .shutdown_timeout(config.shutdown_timeout());

    if let Some(prefix) = &config.channels.prefix {
        builder = builder.channel_prefix(prefix.clone());
    }
    if config.server.trust_identity_headers {
        builder = builder.identity_resolver(trusted_headers());
    }

    builder.build()?.run().await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notify_gateway=info,notify_fanout=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
