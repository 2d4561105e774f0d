/// Configuration management for Product Service
///
/// Loads configuration from environment variables.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ServiceError;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Outbox relay configuration
    pub outbox: OutboxConfig,
    /// Merge worker configuration
    pub consumer: ConsumerConfig,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (development, staging, production)
    pub env: String,
    /// Server host to bind to
    pub host: String,
    /// HTTP port
    pub http_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Max connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Min connections in pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub client_id: String,
    /// Consumer group of the merge worker
    pub group_id: String,
    /// Topic the merge worker consumes
    pub inbound_topic: String,
    /// Topic product events are published to
    pub outbound_topic: String,
    /// Topic receiving messages the merge worker could not apply
    pub dlq_topic: String,
}

/// Outbox relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub batch_size: i32,
    pub poll_interval_secs: u64,
    pub max_retries: i32,
    /// Expose /admin/outbox endpoints
    pub admin_enabled: bool,
}

/// Merge worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub apply_timeout_ms: u64,
    pub apply_max_retries: u32,
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl ConsumerConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}

// Default values
fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let app = AppConfig {
            env: env_or("APP_ENV", "development"),
            host: env_or("APP_HOST", "0.0.0.0"),
            http_port: env_parse("PORT", 8080),
        };

        let database = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable not set")?,
            max_connections: env_parse("DB_MAX_CONNECTIONS", default_max_connections()),
            min_connections: env_parse("DB_MIN_CONNECTIONS", default_min_connections()),
        };

        let inbound_topic = env_or("KAFKA_INBOUND_TOPIC", "rails-to-go");
        let kafka = KafkaConfig {
            brokers: env_or("KAFKA_BROKERS", "kafka:29092"),
            client_id: env_or("KAFKA_CLIENT_ID", "ms-go"),
            group_id: env_or("KAFKA_GROUP_ID", "group_id"),
            outbound_topic: env_or("KAFKA_OUTBOUND_TOPIC", "go-to-rails"),
            dlq_topic: std::env::var("KAFKA_DLQ_TOPIC")
                .unwrap_or_else(|_| format!("{}.dlq", inbound_topic)),
            inbound_topic,
        };

        let outbox = OutboxConfig {
            batch_size: env_parse("OUTBOX_BATCH_SIZE", 100),
            poll_interval_secs: env_parse("OUTBOX_POLL_INTERVAL_SECS", 5),
            max_retries: env_parse("OUTBOX_MAX_RETRIES", 5),
            admin_enabled: std::env::var("OUTBOX_ADMIN_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        };

        let consumer = ConsumerConfig {
            apply_timeout_ms: env_parse("CONSUMER_APPLY_TIMEOUT_MS", 5000),
            apply_max_retries: env_parse("CONSUMER_APPLY_MAX_RETRIES", 3),
        };

        let config = Config {
            app,
            database,
            kafka,
            outbox,
            consumer,
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), ServiceError> {
        if self.outbox.batch_size <= 0 {
            return Err(ServiceError::Config(
                "OUTBOX_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }
        if self.outbox.max_retries <= 0 {
            return Err(ServiceError::Config(
                "OUTBOX_MAX_RETRIES must be greater than zero".to_string(),
            ));
        }
        if self.consumer.apply_timeout_ms == 0 {
            return Err(ServiceError::Config(
                "CONSUMER_APPLY_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }
        if self.kafka.inbound_topic == self.kafka.outbound_topic {
            return Err(ServiceError::Config(format!(
                "inbound and outbound topics must differ (both are {})",
                self.kafka.inbound_topic
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "PORT",
        "KAFKA_INBOUND_TOPIC",
        "KAFKA_OUTBOUND_TOPIC",
        "KAFKA_DLQ_TOPIC",
        "OUTBOX_BATCH_SIZE",
        "OUTBOX_MAX_RETRIES",
        "CONSUMER_APPLY_MAX_RETRIES",
    ];

    fn reset_env() {
        std::env::set_var("DATABASE_URL", "postgres://test");
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_default_values() {
        reset_env();

        let config = Config::from_env().unwrap();

        assert_eq!(config.app.env, "development");
        assert_eq!(config.app.host, "0.0.0.0");
        assert_eq!(config.app.http_port, 8080);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.database.min_connections, 5);
        assert_eq!(config.kafka.inbound_topic, "rails-to-go");
        assert_eq!(config.kafka.outbound_topic, "go-to-rails");
        assert_eq!(config.kafka.dlq_topic, "rails-to-go.dlq");
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.consumer.apply_timeout(), Duration::from_secs(5));
        assert_eq!(config.consumer.apply_max_retries, 3);
    }

    #[test]
    #[serial]
    fn test_dlq_topic_follows_inbound_topic() {
        reset_env();
        std::env::set_var("KAFKA_INBOUND_TOPIC", "catalog-in");

        let config = Config::from_env().unwrap();
        assert_eq!(config.kafka.dlq_topic, "catalog-in.dlq");

        std::env::remove_var("KAFKA_INBOUND_TOPIC");
    }

    #[test]
    #[serial]
    fn test_invalid_numbers_fall_back_to_defaults() {
        reset_env();
        std::env::set_var("PORT", "not-a-port");
        std::env::set_var("CONSUMER_APPLY_MAX_RETRIES", "-1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.app.http_port, 8080);
        assert_eq!(config.consumer.apply_max_retries, 3);

        reset_env();
    }

    #[test]
    #[serial]
    fn test_zero_batch_size_rejected() {
        reset_env();
        std::env::set_var("OUTBOX_BATCH_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("OUTBOX_BATCH_SIZE"));

        reset_env();
    }
}
