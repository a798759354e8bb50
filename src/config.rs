use notify_fanout::GatewayLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Take the client identity from `X-User-Id` / `X-User-Role`.
    /// Only safe behind a proxy that authenticates and overwrites them.
    #[serde(default)]
    pub trust_identity_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            instance_id: default_instance_id(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            trust_identity_headers: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL, e.g., "redis://localhost:6379" or "redis://:password@host:6379"
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Deployment prefix prepended to every channel name
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_message_size: default_max_message_size(),
            rate_limit_per_second: default_rate_limit_per_second(),
            rate_limit_burst: default_rate_limit_burst(),
            buffer_capacity: default_buffer_capacity(),
            write_timeout_secs: default_write_timeout_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

impl GatewayConfig {
    pub fn limits(&self) -> GatewayLimits {
        let pong_timeout = Duration::from_secs(self.pong_timeout_secs);
        GatewayLimits {
            allowed_origins: self.allowed_origins.clone(),
            max_message_size: self.max_message_size,
            rate_limit_per_second: self.rate_limit_per_second,
            rate_limit_burst: self.rate_limit_burst,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            pong_timeout,
            ping_interval: pong_timeout * 9 / 10,
            buffer_capacity: self.buffer_capacity,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_max_message_size() -> usize {
    512
}

fn default_rate_limit_per_second() -> u32 {
    10
}

fn default_rate_limit_burst() -> u32 {
    20
}

fn default_buffer_capacity() -> usize {
    256
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_pong_timeout_secs() -> u64 {
    60
}

fn default_worker_pool_size() -> usize {
    10
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_yaml::from_str(&content)?
        } else {
            Self::default()
        };

        // Environment variables take precedence over the file
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(prefix) = lookup("CHANNEL_PREFIX") {
            self.channels.prefix = Some(prefix).filter(|p| !p.is_empty());
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.gateway.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(size) = lookup("WORKER_POOL_SIZE").and_then(|s| s.parse().ok()) {
            self.gateway.worker_pool_size = size;
        }
        if let Some(trust) = lookup("TRUST_IDENTITY_HEADERS") {
            self.server.trust_identity_headers = trust == "1" || trust == "true";
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.redis.url.is_empty() {
            anyhow::bail!("REDIS_URL environment variable or redis.url is required");
        }
        if self.gateway.max_message_size == 0 {
            anyhow::bail!("gateway.max_message_size must be greater than zero");
        }
        if self.gateway.rate_limit_per_second == 0 {
            anyhow::bail!("gateway.rate_limit_per_second must be greater than zero");
        }
        if self.gateway.buffer_capacity == 0 {
            anyhow::bail!("gateway.buffer_capacity must be greater than zero");
        }
        if self.gateway.write_timeout_secs == 0 {
            anyhow::bail!("gateway.write_timeout_secs must be greater than zero");
        }
        if self.gateway.pong_timeout_secs == 0 {
            anyhow::bail!("gateway.pong_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}
