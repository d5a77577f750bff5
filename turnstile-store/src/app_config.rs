use serde::Deserialize;
use std::env;
use turnstile_core::holds::HoldSettings;
use turnstile_core::queue::QueueSettings;
use turnstile_core::rate_limit::RateLimitSettings;
use turnstile_core::reaper::OrderExpirySettings;
use turnstile_core::sweeper::CleanupSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub holds: HoldSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    #[serde(default)]
    pub cleanup: CleanupSettings,
    #[serde(default)]
    pub order_expiry: OrderExpirySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub key_prefix: String,
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisConfig {
    /// `redis://` or `rediss://` URL assembled from the individual settings.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = match self.password.as_deref() {
            Some(password) if !password.is_empty() => format!(":{}@", password),
            _ => String::new(),
        };
        format!("{}://{}{}:{}/{}", scheme, auth, self.host, self.port, self.db)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_capacity_topic")]
    pub capacity_topic: String,
    #[serde(default = "default_order_paid_topic")]
    pub order_paid_topic: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_group_id() -> String {
    "turnstile-inventory".into()
}

fn default_capacity_topic() -> String {
    "capacity-sync".into()
}

fn default_order_paid_topic() -> String {
    "order-paid".into()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TURNSTILE__HOLDS__TTL_SECONDS=900`
            .add_source(config::Environment::with_prefix("TURNSTILE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis(password: Option<&str>, tls: bool) -> RedisConfig {
        RedisConfig {
            host: "cache.internal".into(),
            port: 6380,
            password: password.map(String::from),
            tls,
            db: 2,
            key_prefix: String::new(),
        }
    }

    #[test]
    fn test_redis_url_from_parts() {
        assert_eq!(redis(None, false).url(), "redis://cache.internal:6380/2");
        assert_eq!(redis(Some("s3cret"), true).url(), "rediss://:s3cret@cache.internal:6380/2");
        assert_eq!(redis(Some(""), false).url(), "redis://cache.internal:6380/2");
    }

    #[test]
    fn test_partial_sections_fall_back_to_defaults() {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                port = 8080
                [database]
                url = "postgres://localhost/turnstile"
                [redis]
                host = "localhost"
                [kafka]
                brokers = "localhost:9092"
                [holds]
                ttl_seconds = 30
                [queue]
                admission_window = 100
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.holds.effective_ttl(), 60);
        assert_eq!(cfg.holds.claimed_ttl_seconds, 3600);
        assert_eq!(cfg.queue.admission_window, 100);
        assert_eq!(cfg.queue.details_ttl_seconds, 3600);
        assert_eq!(cfg.cleanup.batch_size, 100);
        assert_eq!(cfg.kafka.order_paid_topic, "order-paid");
        assert_eq!(cfg.rate_limits.hold.limit, 20);
        assert_eq!(cfg.database.max_connections, 5);
    }
}
