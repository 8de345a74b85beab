//! Output formatting utilities for the CLI
//!
//! Colored status lines plus the framed notices shown when a tunnel comes
//! up, comes up degraded, or fails.

use qt_core::TunnelError;
use qt_tunnel::PlaceholderReason;

const RULE: &str = "--------------------------------------------------------";

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow with a warning symbol prefix
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan with an info symbol prefix
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Frame shown once the public URL is known
pub fn format_tunnel_banner(url: &str) -> String {
    format!(
        "\n{RULE}\nCloudflare Tunnel URL: {url}\nShare this URL to reach your service.\nThis tunnel will remain active until you press Ctrl+C\n{RULE}\n"
    )
}

/// Explanation printed alongside the placeholder URL
pub fn placeholder_advice(reason: PlaceholderReason) -> &'static [&'static str] {
    match reason {
        PlaceholderReason::ControlPlaneOnly => &[
            "Received the generic API URL instead of a unique tunnel URL.",
            "This typically happens when a VPN blocks Cloudflare connections.",
            "Try disabling your VPN to get a proper tunnel URL.",
        ],
        PlaceholderReason::NothingRecognized => &[
            "Couldn't determine the tunnel URL.",
            "Run with -vv and look for a URL like https://something.trycloudflare.com",
        ],
    }
}

/// Guidance for a fatal establishment failure
pub fn failure_advice(error: &TunnelError) -> Vec<String> {
    match error {
        TunnelError::AgentNotInstalled { instructions, .. } => {
            instructions.lines().map(str::to_string).collect()
        }
        TunnelError::ConnectivityTimeout { .. } | TunnelError::NoUrlFound { .. }
            if error.is_connectivity() =>
        {
            vec![
                "Cannot connect to the Cloudflare API. This could be due to:".to_string(),
                "1. VPN blocking Cloudflare connections (most common cause)".to_string(),
                "   - Please disable your VPN and try again".to_string(),
                "2. Network connectivity issues".to_string(),
                "3. Temporary Cloudflare service disruption".to_string(),
            ]
        }
        TunnelError::AgentCrashed { output, .. } => {
            let mut lines = vec!["Last output from cloudflared:".to_string()];
            lines.extend(output.lines().map(|line| format!("  {}", line)));
            lines
        }
        TunnelError::NoUrlFound { .. } => vec![
            "No tunnel URL was reported before the deadline.".to_string(),
            "Increase --timeout or disable strict mode to continue with a placeholder.".to_string(),
        ],
        TunnelError::TunnelAlreadyActive => {
            vec!["Only one tunnel can run per process.".to_string()]
        }
        _ => Vec::new(),
    }
}

/// Print the framed tunnel URL notice
pub fn print_tunnel_banner(url: &str) {
    println!("{}", format_tunnel_banner(url));
}

/// Print the placeholder URL with its caveat
pub fn print_placeholder_notice(url: &str, reason: PlaceholderReason) {
    for line in placeholder_advice(reason) {
        print_warning(line);
    }
    print_warning(&format!("Using placeholder URL: {} (not reachable)", url));
}

/// Print the guidance for a fatal tunnel failure
///
/// The error itself is reported by the caller.
pub fn print_tunnel_failure(error: &TunnelError) {
    let advice = failure_advice(error);
    if advice.is_empty() {
        return;
    }

    eprintln!("\n{RULE}");
    for line in &advice {
        eprintln!("{}", line);
    }
    eprintln!("{RULE}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_contains_url() {
        let banner = format_tunnel_banner("https://a.trycloudflare.com");
        assert!(banner.contains("Cloudflare Tunnel URL: https://a.trycloudflare.com"));
        assert!(banner.contains("Ctrl+C"));
    }

    #[test]
    fn test_placeholder_advice_mentions_vpn_only_for_control_plane() {
        let vpn = placeholder_advice(PlaceholderReason::ControlPlaneOnly);
        assert!(vpn.iter().any(|line| line.contains("VPN")));

        let unknown = placeholder_advice(PlaceholderReason::NothingRecognized);
        assert!(!unknown.iter().any(|line| line.contains("VPN")));
    }

    #[test]
    fn test_connectivity_advice_suggests_vpn() {
        let advice = failure_advice(&TunnelError::ConnectivityTimeout {
            exit_code: Some(1),
            output: "context deadline exceeded".to_string(),
        });
        assert!(advice.iter().any(|line| line.contains("disable your VPN")));
    }

    #[test]
    fn test_crash_advice_includes_output() {
        let advice = failure_advice(&TunnelError::AgentCrashed {
            exit_code: Some(1),
            output: "first\nsecond".to_string(),
        });
        assert_eq!(advice.len(), 3);
        assert_eq!(advice[2], "  second");
    }

    #[test]
    fn test_strict_mode_advice() {
        let advice = failure_advice(&TunnelError::NoUrlFound {
            control_plane_seen: false,
        });
        assert!(advice[0].contains("deadline"));
    }
}
