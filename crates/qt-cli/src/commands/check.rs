//! Agent installation check

use anyhow::Result;

use crate::output::{print_error, print_info, print_success, print_warning};
use qt_core::agent::{agent_version, find_agent, get_install_instructions};

/// Report whether the tunnel agent can be found and which version it is
pub fn check_command(agent: &str) -> Result<()> {
    let path = match find_agent(agent) {
        Some(path) => path,
        None => {
            print_error(&format!("{} is not installed or not on PATH", agent));
            eprintln!();
            eprintln!("{}", get_install_instructions());
            anyhow::bail!("{} is not installed", agent);
        }
    };

    print_success(&format!("{} found at {}", agent, path.display()));

    match agent_version(&path) {
        Ok(version) if !version.is_empty() => print_info(&format!("Version: {}", version)),
        Ok(_) => print_warning("Agent printed no version information"),
        Err(e) => print_warning(&format!("Failed to query agent version: {}", e)),
    }

    Ok(())
}
