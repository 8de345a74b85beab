//! quicktunnel CLI
//!
//! Single binary for exposing a local service through a Cloudflare quick
//! tunnel:
//! - `serve` starts the tunnel agent and holds the tunnel open
//! - `check` verifies the agent installation
//! - `config` inspects and edits the configuration file

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quicktunnel::commands::{self, ServeOptions};

#[derive(Parser)]
#[command(name = "quicktunnel")]
#[command(author, version, about = "Expose a local service through a Cloudflare quick tunnel")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "QUICKTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable verbose output (debug logging, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tunnel and keep it open until Ctrl+C (default)
    Serve(ServeArgs),

    /// Check that the tunnel agent is installed
    Check {
        /// Agent executable to look for (overrides config)
        #[arg(long)]
        agent: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Local port to expose (overrides config)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Skip starting the tunnel
    #[arg(long)]
    no_tunnel: bool,

    /// Fail if no tunnel URL is reported instead of using a placeholder
    #[arg(long)]
    strict: bool,

    /// Seconds to wait for the tunnel URL (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Agent executable (overrides config)
    #[arg(long)]
    agent: Option<String>,
}

impl ServeArgs {
    /// Arguments used when no subcommand is given; environment fallbacks still apply
    fn from_env() -> Self {
        #[derive(Parser)]
        struct DefaultServe {
            #[command(flatten)]
            args: ServeArgs,
        }

        DefaultServe::parse_from(["quicktunnel"]).args
    }
}

impl From<ServeArgs> for ServeOptions {
    fn from(args: ServeArgs) -> Self {
        Self {
            port: args.port,
            no_tunnel: args.no_tunnel,
            strict: args.strict,
            timeout: args.timeout,
            agent: args.agent,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get specific config value
    Get { key: String },
    /// Set config value
    Set { key: String, value: String },
    /// Show config file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => cli.log_level.as_str(),
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config_path = cli.config.as_ref();

    match cli.command {
        None => {
            commands::serve_command(config_path, ServeArgs::from_env().into()).await?;
        }

        Some(Commands::Serve(args)) => {
            commands::serve_command(config_path, args.into()).await?;
        }

        Some(Commands::Check { agent }) => {
            let agent = match agent {
                Some(agent) => agent,
                None => commands::load_config_file(config_path)?.tunnel.agent,
            };
            commands::check_command(&agent)?;
        }

        Some(Commands::Config { action }) => match action {
            ConfigAction::Show => commands::config_show(config_path)?,
            ConfigAction::Get { key } => commands::config_get(config_path, &key)?,
            ConfigAction::Set { key, value } => commands::config_set(config_path, &key, &value)?,
            ConfigAction::Path => commands::config_path(config_path)?,
            ConfigAction::Init { force } => commands::config_init(config_path, force)?,
        },
    }

    Ok(())
}
