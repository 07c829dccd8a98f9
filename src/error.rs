//! Shared error types for endpoint construction and configuration.

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Invalid endpoint configuration; raised during `init` so a broken peer
/// definition fails fast instead of silently dropping data.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key '{key}'")]
    MissingKey { key: &'static str },

    #[error("configuration key '{key}' must be positive, got {value}")]
    NotPositive { key: &'static str, value: i64 },

    #[error("'decode.mode' is \"typed\" but 'schema.path' is not set")]
    MissingSchemaPath,

    #[error("configuration key '{key}' has invalid value '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Endpoint lifecycle failure.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid endpoint configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create kafka producer: {0}")]
    Producer(#[source] KafkaError),

    #[error("failed to create kafka admin client: {0}")]
    Admin(#[source] KafkaError),
}
