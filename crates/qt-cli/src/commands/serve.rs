//! Serve command: expose the local service through a tunnel

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::commands::load_config_file;
use crate::output::{
    print_info, print_placeholder_notice, print_success, print_tunnel_banner, print_tunnel_failure,
    print_warning,
};
use qt_core::config::ConfigFile;
use qt_core::{BroadcastPublisher, StatusEnvelope, StatusPublisher, TunnelError, TunnelStatus};
use qt_tunnel::{TunnelSupervisor, UrlStatus};

/// Command-line overrides for the serve command
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub port: Option<u16>,
    pub no_tunnel: bool,
    pub strict: bool,
    /// Establish timeout in seconds
    pub timeout: Option<u64>,
    pub agent: Option<String>,
}

impl ServeOptions {
    fn apply(&self, config: &mut ConfigFile) {
        if let Some(port) = self.port {
            config.service.port = port;
        }
        if self.strict {
            config.tunnel.strict = true;
        }
        if let Some(timeout) = self.timeout {
            config.tunnel.establish_timeout = Duration::from_secs(timeout);
        }
        if let Some(agent) = &self.agent {
            config.tunnel.agent = agent.clone();
        }
    }
}

/// Establish the tunnel, report it, and hold it open until shutdown is requested
pub async fn serve_command(config_path: Option<&PathBuf>, options: ServeOptions) -> Result<()> {
    let mut config = load_config_file(config_path)?;
    options.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let publisher = BroadcastPublisher::default();
    tokio::spawn(log_status_events(publisher.subscribe()));

    let port = config.service.port;

    if options.no_tunnel {
        print_info(&format!(
            "Tunnel disabled; service available at http://{}",
            config.service.local_address()
        ));
        cancel.cancelled().await;
        return Ok(());
    }

    print_info(&format!(
        "Starting Cloudflare Tunnel for {}...",
        config.tunnel.local_url(port)
    ));
    publisher.publish_status(&TunnelStatus::Starting { port });

    let mut supervisor =
        TunnelSupervisor::from_config(config.tunnel.clone()).with_cancellation(cancel.clone());

    let tunnel = match supervisor.establish(port).await {
        Ok(tunnel) => tunnel,
        Err(TunnelError::Cancelled) => {
            print_warning("Interrupted before the tunnel was established");
            publisher.publish_status(&TunnelStatus::Stopped);
            return Ok(());
        }
        Err(e) => {
            publisher.publish_status(&TunnelStatus::Failed {
                error: e.to_string(),
            });
            print_tunnel_failure(&e);
            return Err(e).context("Error setting up Cloudflare Tunnel");
        }
    };

    match tunnel.status {
        UrlStatus::Confirmed => {
            publisher.publish_status(&TunnelStatus::Established {
                url: tunnel.url.clone(),
            });
        }
        UrlStatus::Placeholder(reason) => {
            publisher.publish_status(&TunnelStatus::Degraded {
                url: tunnel.url.clone(),
                reason: reason.to_string(),
            });
            print_placeholder_notice(&tunnel.url, reason);
        }
    }

    print_tunnel_banner(&tunnel.url);
    print_info(&format!(
        "Local service on {} is only reachable through the tunnel URL",
        config.service.local_address()
    ));

    cancel.cancelled().await;

    print_info("Shutting down tunnel...");
    let uptime = supervisor.uptime();
    supervisor.teardown().await;
    publisher.publish_status(&TunnelStatus::Stopped);
    match uptime {
        Some(uptime) => print_success(&format!(
            "Tunnel stopped after {}s",
            uptime.as_secs()
        )),
        None => print_success("Tunnel stopped"),
    }

    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
///
/// The SIGTERM handler is installed before returning.
fn spawn_signal_handler(cancel: CancellationToken) {
    #[cfg(unix)]
    let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}

/// Log every published status event until the publisher goes away
async fn log_status_events(mut rx: broadcast::Receiver<StatusEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                tracing::info!(
                    event = %envelope.event,
                    room = %envelope.room,
                    "{}",
                    envelope.payload
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Status log skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
