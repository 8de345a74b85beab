//! qt-tunnel: Tunnel agent supervision for quicktunnel
//!
//! Launches `cloudflared` for a local port, scans its stdout and stderr for
//! the assigned `*.trycloudflare.com` URL under a bounded deadline, classifies
//! early exits, and tears the agent down with graceful-then-forced
//! termination.

pub mod fake;
pub mod launcher;
pub mod process;
pub mod scanner;
pub mod supervisor;

pub use launcher::{AgentLauncher, CloudflaredLauncher, LaunchedAgent};
pub use process::{AgentExit, AgentProcess, TokioAgentProcess};
pub use scanner::{match_url, LineScanner, OutputBuffer, StreamKind, PLACEHOLDER_URL};
pub use supervisor::{PlaceholderReason, SupervisorState, TunnelSupervisor, TunnelUrl, UrlStatus};
