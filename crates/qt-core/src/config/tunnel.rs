//! Tunnel agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::agent::DEFAULT_AGENT;
use crate::error::ConfigError;

/// Longest accepted polling round
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Longest accepted wait for the public URL
pub const MAX_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for launching and supervising the tunnel agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Agent executable, looked up on the search path unless it contains a
    /// path separator
    pub agent: String,

    /// Host the agent forwards traffic to
    pub local_host: String,

    /// How long to wait for the agent to report a public URL
    #[serde(with = "duration_secs")]
    pub establish_timeout: Duration,

    /// Length of one polling round
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// How long the agent gets to exit after a graceful termination request
    #[serde(with = "duration_secs")]
    pub graceful_timeout: Duration,

    /// How long to wait after a forceful kill
    #[serde(with = "duration_secs")]
    pub kill_timeout: Duration,

    /// Fail instead of returning the placeholder URL when none is recognized
    pub strict: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.to_string(),
            local_host: "localhost".to_string(),
            establish_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(1),
            graceful_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
            strict: false,
        }
    }
}

impl TunnelConfig {
    /// Number of polling rounds that fit into the establish timeout
    pub fn rounds(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        u32::try_from(self.establish_timeout.as_millis() / interval).unwrap_or(u32::MAX)
    }

    /// URL of the local service as passed to the agent
    pub fn local_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.local_host, port)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.trim().is_empty() {
            return Err(ConfigError::Invalid("tunnel.agent must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "tunnel.poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval > MAX_POLL_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "tunnel.poll_interval must be at most {:?}",
                MAX_POLL_INTERVAL
            )));
        }
        if self.establish_timeout > MAX_ESTABLISH_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "tunnel.establish_timeout must be at most {:?}",
                MAX_ESTABLISH_TIMEOUT
            )));
        }
        if self.rounds() == 0 {
            return Err(ConfigError::Invalid(format!(
                "tunnel.establish_timeout ({:?}) is shorter than one polling round ({:?})",
                self.establish_timeout, self.poll_interval
            )));
        }
        Ok(())
    }
}
