//! Tunnel agent discovery
//!
//! Locates the `cloudflared` executable on the search path and provides
//! platform-specific installation instructions when it is missing.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::TunnelError;

/// Default tunnel agent executable name
pub const DEFAULT_AGENT: &str = "cloudflared";

/// Resolve an agent name to an executable path
///
/// Names containing a path separator are checked directly; bare names are
/// searched for in every `PATH` entry.
pub fn find_agent(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .flat_map(|dir| executable_names(name).map(move |file| dir.join(file)))
        .find(|path| is_executable(path))
}

/// Resolve the agent or fail with `AgentNotInstalled`
pub fn require_agent(name: &str) -> Result<PathBuf, TunnelError> {
    find_agent(name).ok_or_else(|| TunnelError::AgentNotInstalled {
        agent: name.to_string(),
        instructions: get_install_instructions(),
    })
}

/// Check if the agent is installed
pub fn is_agent_installed(name: &str) -> bool {
    find_agent(name).is_some()
}

/// Run `<agent> --version` and return its first line of output
pub fn agent_version(path: &Path) -> std::io::Result<String> {
    let output = Command::new(path).arg("--version").output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let version = stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("unknown version")
        .to_string();

    Ok(version)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(windows)]
fn executable_names(name: &str) -> impl Iterator<Item = String> + Clone + '_ {
    ["", ".exe", ".cmd", ".bat"]
        .into_iter()
        .map(move |ext| format!("{}{}", name, ext))
}

#[cfg(not(windows))]
fn executable_names(name: &str) -> impl Iterator<Item = String> + Clone + '_ {
    std::iter::once(name.to_string())
}

/// Get platform-specific cloudflared installation instructions
pub fn get_install_instructions() -> String {
    #[cfg(target_os = "macos")]
    {
        r#"cloudflared is not installed. Install it with:

    brew install cloudflared

Or download from: https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/"#
            .to_string()
    }

    #[cfg(target_os = "linux")]
    {
        r#"cloudflared is not installed. Follow the instructions for your distribution at:

    https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/

Debian/Ubuntu users can install the .deb package from the cloudflared releases page."#
            .to_string()
    }

    #[cfg(target_os = "windows")]
    {
        r#"cloudflared is not installed. Install it with:

    winget install --id Cloudflare.cloudflared

Then open a new terminal so it is on your PATH."#
            .to_string()
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        r#"cloudflared is not installed. Visit https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/ for installation instructions."#.to_string()
    }
}
