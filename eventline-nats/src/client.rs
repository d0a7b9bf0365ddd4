//! NATS connection handling

use std::time::Duration;

use async_nats::ConnectOptions;
use tracing::info;

use crate::error::{NatsError, NatsResult};

/// Configuration for the NATS connection
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,

    /// Client name
    pub name: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Request timeout
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "eventline".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Connect to NATS with the given configuration.
pub async fn connect(config: &NatsConfig) -> NatsResult<async_nats::Client> {
    let options = ConnectOptions::new()
        .name(&config.name)
        .connection_timeout(config.connect_timeout)
        .request_timeout(Some(config.request_timeout));

    let client = async_nats::connect_with_options(config.servers.join(","), options)
        .await
        .map_err(|e| NatsError::Connection(e.to_string()))?;

    info!(servers = ?config.servers, "connected to NATS");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.servers, vec!["nats://localhost:4222"]);
        assert_eq!(config.name, "eventline");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
