//! Tunnel agent launching

use std::process::Stdio;

use qt_core::agent;
use qt_core::config::TunnelConfig;
use qt_core::TunnelError;
use tokio::process::Command;

use crate::process::{AgentProcess, TokioAgentProcess};
use crate::scanner::{LineScanner, StreamKind};

/// A freshly started agent with both output pipes attached to scanners
pub struct LaunchedAgent {
    pub process: Box<dyn AgentProcess>,
    pub stdout: LineScanner,
    pub stderr: LineScanner,
}

/// Starts tunnel agents
pub trait AgentLauncher: Send + Sync {
    /// Start an agent forwarding public traffic to the local `port`
    fn launch(&self, port: u16) -> Result<LaunchedAgent, TunnelError>;
}

/// Launches `cloudflared tunnel --no-autoupdate --url http://<host>:<port>`
#[derive(Debug, Clone)]
pub struct CloudflaredLauncher {
    agent: String,
    local_host: String,
}

impl CloudflaredLauncher {
    pub fn new(agent: impl Into<String>, local_host: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            local_host: local_host.into(),
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(config.agent.clone(), config.local_host.clone())
    }

    /// Arguments passed to the agent for `port`
    pub fn args(&self, port: u16) -> Vec<String> {
        vec![
            "tunnel".to_string(),
            "--no-autoupdate".to_string(),
            "--url".to_string(),
            format!("http://{}:{}", self.local_host, port),
        ]
    }
}

impl Default for CloudflaredLauncher {
    fn default() -> Self {
        Self::from_config(&TunnelConfig::default())
    }
}

impl AgentLauncher for CloudflaredLauncher {
    fn launch(&self, port: u16) -> Result<LaunchedAgent, TunnelError> {
        let program = agent::require_agent(&self.agent)?;
        let args = self.args(port);

        tracing::debug!("Launching {:?} {}", program, args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("agent stderr was not captured"))?;

        tracing::info!(
            "Started tunnel agent {} (pid {})",
            program.display(),
            child.id().map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_string())
        );

        Ok(LaunchedAgent {
            process: Box::new(TokioAgentProcess::new(child)),
            stdout: LineScanner::spawn(StreamKind::Stdout, stdout),
            stderr: LineScanner::spawn(StreamKind::Stderr, stderr),
        })
    }
}
