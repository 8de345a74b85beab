//! quicktunnel: Command-line interface
//!
//! Provides the `quicktunnel` CLI that exposes a local port through a
//! Cloudflare quick tunnel and manages its configuration.

pub mod commands;
pub mod output;
