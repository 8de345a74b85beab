//! Local service configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The local service that gets exposed through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Local port the service listens on
    pub port: u16,

    /// Host the service binds to. Only reachable publicly through the tunnel.
    pub bind_host: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 5001,
            bind_host: "127.0.0.1".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Local address of the service (host:port)
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("service.port must not be 0".to_string()));
        }
        Ok(())
    }
}
