//! qt-core: Core types and configuration for quicktunnel
//!
//! This crate provides the error taxonomy, configuration structures,
//! tunnel agent discovery and the status event interface shared by the
//! tunnel supervisor and the CLI.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;

pub use error::{ConfigError, TunnelError};
pub use events::{BroadcastPublisher, StatusEnvelope, StatusPublisher, TunnelStatus};
