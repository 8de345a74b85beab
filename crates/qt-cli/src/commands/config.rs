//! Config command implementations

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use qt_core::config::{self, ConfigFile};
use qt_core::ConfigError;

fn resolve_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path.cloned().unwrap_or_else(config::default_config_path)
}

/// Load the configuration, falling back to defaults when the default file is absent
///
/// An explicitly requested file must exist.
pub fn load_config_file(config_path: Option<&PathBuf>) -> Result<ConfigFile> {
    let path = resolve_path(config_path);

    match config::load_config::<ConfigFile>(&path) {
        Ok(config) => {
            tracing::debug!("Loaded configuration from {:?}", path);
            Ok(config)
        }
        Err(ConfigError::NotFound(_)) if config_path.is_none() => {
            tracing::debug!("No configuration at {:?}, using defaults", path);
            Ok(ConfigFile::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to load config file: {:?}", path)),
    }
}

/// Print the config file location
pub fn config_path(config_path: Option<&PathBuf>) -> Result<()> {
    println!("{}", resolve_path(config_path).display());
    Ok(())
}

/// Get a config value by key
pub fn config_get(config_path: Option<&PathBuf>, key: &str) -> Result<()> {
    let path = resolve_path(config_path);

    // Fall back to the effective defaults so every key is answerable
    let table: toml::Table = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        toml::Table::try_from(ConfigFile::default())?
    };

    // Navigate through the key path (e.g., "tunnel.establish_timeout")
    let mut current: &toml::Value = &toml::Value::Table(table);
    for part in key.split('.') {
        current = match current {
            toml::Value::Table(t) => match t.get(part) {
                Some(v) => v,
                None => anyhow::bail!("Key not found: {}", key),
            },
            _ => anyhow::bail!("Key not found: {}", key),
        };
    }

    match current {
        toml::Value::String(s) => println!("{}", s),
        toml::Value::Integer(i) => println!("{}", i),
        toml::Value::Float(f) => println!("{}", f),
        toml::Value::Boolean(b) => println!("{}", b),
        toml::Value::Array(a) => {
            for item in a {
                println!("{}", item);
            }
        }
        toml::Value::Table(_) => println!("{}", toml::to_string_pretty(current)?),
        toml::Value::Datetime(d) => println!("{}", d),
    }

    Ok(())
}

/// Set a config value by key
///
/// The edited file must still describe a valid configuration.
pub fn config_set(config_path: Option<&PathBuf>, key: &str, value: &str) -> Result<()> {
    let path = resolve_path(config_path);

    if !path.exists() {
        print_info("Creating default configuration...");
        config_init(config_path, false)?;
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let mut table: toml::Table =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    let parts: Vec<&str> = key.split('.').collect();
    let (last_key, parents) = parts
        .split_last()
        .filter(|(last, _)| !last.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid key: key path cannot be empty"))?;

    let mut current = &mut table;
    for part in parents {
        if !current.contains_key(*part) {
            current.insert(part.to_string(), toml::Value::Table(toml::Table::new()));
        }
        current = current
            .get_mut(*part)
            .and_then(|v| v.as_table_mut())
            .ok_or_else(|| anyhow::anyhow!("Cannot navigate to key: {}", key))?;
    }

    current.insert(last_key.to_string(), parse_value(value));

    let updated: ConfigFile = toml::Table::try_into(table.clone())
        .with_context(|| format!("Invalid value for {}: {}", key, value))?;
    updated
        .validate()
        .with_context(|| format!("Invalid value for {}: {}", key, value))?;

    let new_content = toml::to_string_pretty(&table)?;
    std::fs::write(&path, new_content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}

fn parse_value(value: &str) -> toml::Value {
    if value == "true" {
        toml::Value::Boolean(true)
    } else if value == "false" {
        toml::Value::Boolean(false)
    } else if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    }
}

/// Show current configuration
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = resolve_path(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Using built-in defaults:");
        println!();
        println!("{}", toml::to_string_pretty(&ConfigFile::default())?);
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    println!();

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);

    Ok(())
}

/// Initialize default configuration
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let config_file = resolve_path(config_path);

    if let Some(config_dir) = config_file.parent() {
        if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
            std::fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
            print_success(&format!("Created config directory: {:?}", config_dir));
        }
    }

    if config_file.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", config_file));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    std::fs::write(&config_file, generate_default_config())
        .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

    print_success(&format!("Created configuration file: {:?}", config_file));
    Ok(())
}

/// Generate default configuration content
fn generate_default_config() -> String {
    r#"# quicktunnel configuration

[service]
# Port of the local service exposed through the tunnel
port = 5001

# Address the local service binds to
bind_host = "127.0.0.1"

[tunnel]
# Agent executable (name on PATH or absolute path)
agent = "cloudflared"

# Host the agent forwards traffic to
local_host = "localhost"

# Seconds to wait for the agent to report a public URL
establish_timeout = 20

# Milliseconds between output polls
poll_interval = 1000

# Seconds the agent gets to exit after SIGTERM
graceful_timeout = 5

# Seconds to wait after a forced kill
kill_timeout = 2

# Fail instead of continuing with a placeholder URL
strict = false
"#
    .to_string()
}
