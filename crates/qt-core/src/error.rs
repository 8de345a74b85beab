//! Core error types for quicktunnel

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while establishing a tunnel
///
/// Every variant except `NoUrlFound` is fatal for the establishment attempt.
/// `NoUrlFound` is only produced in strict mode; otherwise a missing URL is
/// reported as a placeholder result.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The tunnel agent binary could not be found on the search path
    #[error("{agent} is not installed")]
    AgentNotInstalled {
        /// Name or path of the agent that was looked up
        agent: String,
        /// Platform-specific install instructions
        instructions: String,
    },

    /// The agent reported a deadline/timeout talking to the control plane
    #[error("cannot reach the tunnel service (agent exited with {}): {output}", describe_exit(.exit_code))]
    ConnectivityTimeout {
        exit_code: Option<i32>,
        /// Last lines of agent output
        output: String,
    },

    /// The agent exited before producing a URL, with no connectivity evidence
    #[error("tunnel agent exited with {}. Output: {output}", describe_exit(.exit_code))]
    AgentCrashed {
        exit_code: Option<i32>,
        /// Last lines of agent output
        output: String,
    },

    /// No tunnel URL was recognized within the deadline (strict mode)
    #[error("couldn't determine the tunnel URL{}", control_plane_note(.control_plane_seen))]
    NoUrlFound { control_plane_seen: bool },

    /// A tunnel is already running for this supervisor
    #[error("a tunnel is already active")]
    TunnelAlreadyActive,

    /// The agent was found but could not be started
    #[error("failed to start tunnel agent: {0}")]
    Spawn(#[from] std::io::Error),

    /// Shutdown was requested while the tunnel was being established
    #[error("tunnel establishment cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Whether the failure points at blocked outbound connectivity (VPN, firewall)
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectivityTimeout { .. }
                | TunnelError::NoUrlFound {
                    control_plane_seen: true
                }
        )
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("error code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn control_plane_note(seen: &bool) -> &'static str {
    if *seen {
        " (only the control-plane host was reported)"
    } else {
        ""
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
