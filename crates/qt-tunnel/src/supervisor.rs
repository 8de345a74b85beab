//! Tunnel supervisor
//!
//! Owns at most one running tunnel agent. `establish` launches the agent and
//! polls its output in fixed rounds until a public URL shows up, the deadline
//! passes, or the agent dies. `teardown` stops the agent with SIGTERM first
//! and SIGKILL if it does not comply.

use std::fmt;
use std::time::Duration;

use qt_core::config::{TunnelConfig, MAX_POLL_INTERVAL};
use qt_core::TunnelError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::launcher::{AgentLauncher, CloudflaredLauncher, LaunchedAgent};
use crate::process::{AgentExit, AgentProcess};
use crate::scanner::{LineScanner, OutputBuffer, PLACEHOLDER_URL};

/// Output markers of the agent failing to reach the control plane
const CONNECTIVITY_MARKERS: [&str; 2] = ["context deadline exceeded", "Client.Timeout exceeded"];

/// Lines of output inspected when the agent exits early
const DIAGNOSTIC_TAIL: usize = 10;

/// How long to keep reading pipes after the agent exited
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Why the placeholder URL was returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderReason {
    /// Only the provider's API host was reported; usually a VPN blocking the tunnel
    ControlPlaneOnly,
    /// Nothing resembling a tunnel URL was printed
    NothingRecognized,
}

impl fmt::Display for PlaceholderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderReason::ControlPlaneOnly => write!(
                f,
                "received the generic API host instead of a unique tunnel URL; a VPN is likely blocking Cloudflare connections"
            ),
            PlaceholderReason::NothingRecognized => {
                write!(f, "couldn't determine the tunnel URL from the agent output")
            }
        }
    }
}

/// How confident the supervisor is in the returned URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStatus {
    /// Reported by the agent
    Confirmed,
    /// `PLACEHOLDER_URL`, the real endpoint is unknown
    Placeholder(PlaceholderReason),
}

/// Public URL produced by a successful establishment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelUrl {
    pub url: String,
    pub status: UrlStatus,
}

impl TunnelUrl {
    fn confirmed(url: String) -> Self {
        Self {
            url,
            status: UrlStatus::Confirmed,
        }
    }

    fn placeholder(reason: PlaceholderReason) -> Self {
        Self {
            url: PLACEHOLDER_URL.to_string(),
            status: UrlStatus::Placeholder(reason),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == UrlStatus::Confirmed
    }
}

impl fmt::Display for TunnelUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Whether the supervisor currently owns an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Active,
}

/// The running agent
struct TunnelProcess {
    process: Box<dyn AgentProcess>,
    stdout: LineScanner,
    stderr: LineScanner,
    started_at: Instant,
    url: Option<TunnelUrl>,
}

/// Supervises a single tunnel agent
pub struct TunnelSupervisor<L: AgentLauncher = CloudflaredLauncher> {
    launcher: L,
    config: TunnelConfig,
    cancel: CancellationToken,
    active: Option<TunnelProcess>,
}

impl TunnelSupervisor<CloudflaredLauncher> {
    /// Supervisor launching the agent named in `config`
    pub fn from_config(config: TunnelConfig) -> Self {
        let launcher = CloudflaredLauncher::from_config(&config);
        Self::new(launcher, config)
    }
}

impl<L: AgentLauncher> TunnelSupervisor<L> {
    pub fn new(launcher: L, config: TunnelConfig) -> Self {
        Self {
            launcher,
            config,
            cancel: CancellationToken::new(),
            active: None,
        }
    }

    /// Abort establishment when `cancel` fires
    ///
    /// Checked at every polling round boundary and during the round sleep.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SupervisorState {
        if self.active.is_some() {
            SupervisorState::Active
        } else {
            SupervisorState::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// URL of the running tunnel
    pub fn url(&self) -> Option<&TunnelUrl> {
        self.active.as_ref().and_then(|tunnel| tunnel.url.as_ref())
    }

    /// Process id of the running agent
    pub fn pid(&self) -> Option<u32> {
        self.active.as_ref().and_then(|tunnel| tunnel.process.id())
    }

    /// Time since the running agent was launched
    pub fn uptime(&self) -> Option<Duration> {
        self.active.as_ref().map(|tunnel| tunnel.started_at.elapsed())
    }

    /// Launch the agent for `port` and wait for its public URL
    ///
    /// Returns the placeholder URL when nothing was recognized before the
    /// deadline, unless strict mode is enabled. On error the agent has been
    /// stopped and the supervisor is idle again, except for
    /// `TunnelAlreadyActive`, which leaves the running tunnel untouched.
    pub async fn establish(&mut self, port: u16) -> Result<TunnelUrl, TunnelError> {
        if self.active.is_some() {
            return Err(TunnelError::TunnelAlreadyActive);
        }

        tracing::info!("Setting up tunnel to {}", self.config.local_url(port));

        let LaunchedAgent {
            process,
            stdout,
            stderr,
        } = self.launcher.launch(port)?;

        let tunnel = self.active.insert(TunnelProcess {
            process,
            stdout,
            stderr,
            started_at: Instant::now(),
            url: None,
        });

        tracing::info!("Waiting for tunnel to establish...");

        match poll_for_url(tunnel, &self.config, &self.cancel).await {
            Ok(url) => {
                tracing::info!(
                    "Tunnel ready after {:?}: {}",
                    tunnel.started_at.elapsed(),
                    url
                );
                tunnel.url = Some(url.clone());
                Ok(url)
            }
            Err(e) => {
                let exited = matches!(
                    e,
                    TunnelError::ConnectivityTimeout { .. } | TunnelError::AgentCrashed { .. }
                );
                if exited {
                    // Already reaped, nothing left to stop
                    self.active = None;
                } else {
                    self.teardown().await;
                }
                Err(e)
            }
        }
    }

    /// Stop the running agent
    ///
    /// Sends a graceful termination request, escalates to a forceful kill
    /// after `graceful_timeout`, and gives up after `kill_timeout`. Errors
    /// are logged, never returned. The supervisor is idle afterwards even if
    /// the agent could not be stopped; calling this while idle is a no-op.
    pub async fn teardown(&mut self) {
        let Some(mut tunnel) = self.active.take() else {
            tracing::debug!("No tunnel agent running, nothing to tear down");
            return;
        };

        tracing::info!("Terminating tunnel agent...");

        if let Err(e) = tunnel.process.terminate() {
            tracing::warn!("Failed to send termination request to tunnel agent: {}", e);
        }

        let graceful = self.config.graceful_timeout;
        match tokio::time::timeout(graceful, tunnel.process.wait()).await {
            Ok(Ok(exit)) => {
                tracing::info!("Tunnel agent terminated successfully ({})", exit);
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for tunnel agent to exit: {}", e);
            }
            Err(_) => {
                tracing::warn!(
                    "Tunnel agent still running {:?} after termination request, killing it",
                    graceful
                );
            }
        }

        if let Err(e) = tunnel.process.kill() {
            tracing::error!("Failed to kill tunnel agent: {}", e);
        }

        match tokio::time::timeout(self.config.kill_timeout, tunnel.process.wait()).await {
            Ok(Ok(exit)) => tracing::info!("Tunnel agent killed ({})", exit),
            Ok(Err(e)) => tracing::error!("Error waiting for killed tunnel agent: {}", e),
            Err(_) => tracing::error!(
                "Tunnel agent (pid {:?}) did not exit after kill, abandoning it",
                tunnel.process.id()
            ),
        }
    }
}

impl<L: AgentLauncher> Drop for TunnelSupervisor<L> {
    fn drop(&mut self) {
        if self.active.is_some() {
            tracing::warn!("Tunnel supervisor dropped without teardown; agent will be killed");
        }
    }
}

/// Polling loop of one establishment attempt
async fn poll_for_url(
    tunnel: &mut TunnelProcess,
    config: &TunnelConfig,
    cancel: &CancellationToken,
) -> Result<TunnelUrl, TunnelError> {
    let mut buffer = OutputBuffer::new();
    let rounds = config.rounds();

    for round in 0..rounds {
        let round_deadline = Instant::now() + config.poll_interval.min(MAX_POLL_INTERVAL);

        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        match tunnel.process.try_wait() {
            Ok(Some(exit)) => {
                let drain_deadline = Instant::now() + EXIT_DRAIN_GRACE;
                tunnel.stdout.drain_until_closed(&mut buffer, drain_deadline).await;
                tunnel.stderr.drain_until_closed(&mut buffer, drain_deadline).await;
                return Err(classify_exit(exit, &buffer));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to poll tunnel agent status: {}", e),
        }

        if let Some(url) = tunnel.stdout.scan(&mut buffer) {
            return Ok(TunnelUrl::confirmed(url));
        }
        if let Some(url) = tunnel.stderr.scan(&mut buffer) {
            return Ok(TunnelUrl::confirmed(url));
        }

        tracing::debug!(
            "No tunnel URL yet (round {}/{}, {} lines captured)",
            round + 1,
            rounds,
            buffer.len()
        );

        tokio::select! {
            _ = tokio::time::sleep_until(round_deadline) => {}
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
        }
    }

    if let Some(url) = buffer.find_url() {
        tracing::debug!("Recovered tunnel URL from captured output");
        return Ok(TunnelUrl::confirmed(url));
    }

    let control_plane_seen = buffer.saw_control_plane();
    if config.strict {
        return Err(TunnelError::NoUrlFound { control_plane_seen });
    }

    let reason = if control_plane_seen {
        for line in buffer.candidate_lines() {
            tracing::warn!("Potential URL line: {}", line);
        }
        PlaceholderReason::ControlPlaneOnly
    } else {
        PlaceholderReason::NothingRecognized
    };
    tracing::warn!("{}; using placeholder {}", reason, PLACEHOLDER_URL);

    Ok(TunnelUrl::placeholder(reason))
}

/// Decide why the agent exited before reporting a URL
fn classify_exit(exit: AgentExit, buffer: &OutputBuffer) -> TunnelError {
    let output = buffer.tail_text(DIAGNOSTIC_TAIL);

    if CONNECTIVITY_MARKERS
        .iter()
        .any(|marker| output.contains(marker))
    {
        tracing::error!("Tunnel agent cannot reach Cloudflare ({})", exit);
        TunnelError::ConnectivityTimeout {
            exit_code: exit.code,
            output,
        }
    } else {
        tracing::error!("Tunnel agent exited early ({})", exit);
        TunnelError::AgentCrashed {
            exit_code: exit.code,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeAgentHandle, FakeLauncher};

    const URL: &str = "https://quiet-lake-bright-sun.trycloudflare.com";

    fn supervisor() -> (TunnelSupervisor<FakeLauncher>, FakeAgentHandle) {
        let (launcher, handle) = FakeLauncher::new();
        (
            TunnelSupervisor::new(launcher, TunnelConfig::default()),
            handle,
        )
    }

    fn banner(url: &str) -> String {
        format!("INF |  {}  |", url)
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_on_stdout_returns_in_first_round() {
        let (mut supervisor, agent) = supervisor();
        agent.stdout(banner(URL));

        let started = Instant::now();
        let url = supervisor.establish(5001).await.unwrap();

        assert_eq!(url.url, URL);
        assert!(url.is_confirmed());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(supervisor.state(), SupervisorState::Active);
        assert_eq!(supervisor.url(), Some(&url));
        assert_eq!(agent.launched_ports(), vec![5001]);
        assert!(supervisor.uptime().is_some());

        supervisor.teardown().await;
        assert!(supervisor.uptime().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timings_do_not_overflow_round_deadline() {
        let (launcher, agent) = FakeLauncher::new();
        let config = TunnelConfig {
            establish_timeout: Duration::from_secs(u64::MAX),
            poll_interval: Duration::from_millis(u64::MAX),
            ..Default::default()
        };
        let mut supervisor = TunnelSupervisor::new(launcher, config);

        let late = agent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            late.stdout(banner(URL));
        });

        let started = Instant::now();
        let url = supervisor.establish(5001).await.unwrap();

        assert_eq!(url.url, URL);
        // Found at the end of the first round, capped at the longest accepted interval
        assert!(started.elapsed() <= MAX_POLL_INTERVAL + Duration::from_secs(1));

        supervisor.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_on_stderr_after_a_few_rounds() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr("INF Requesting new quick Tunnel on trycloudflare.com...");

        let late = agent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            late.stderr(banner(URL));
        });

        let started = Instant::now();
        let url = supervisor.establish(5001).await.unwrap();

        assert_eq!(url.url, URL);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(5));

        supervisor.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stdout_wins_over_stderr_in_same_round() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr(banner("https://from-stderr.trycloudflare.com"));
        agent.stdout(banner("https://from-stdout.trycloudflare.com"));

        let url = supervisor.establish(5001).await.unwrap();
        assert_eq!(url.url, "https://from-stdout.trycloudflare.com");

        supervisor.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_with_deadline_is_connectivity_timeout() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr("ERR failed to request quick Tunnel: Post \"https://api.trycloudflare.com/tunnel\": context deadline exceeded");
        agent.exit(1);

        match supervisor.establish(5001).await {
            Err(TunnelError::ConnectivityTimeout { exit_code, output }) => {
                assert_eq!(exit_code, Some(1));
                assert!(output.contains("context deadline exceeded"));
            }
            other => panic!("expected ConnectivityTimeout, got {:?}", other),
        }
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_timeout_marker_is_connectivity_timeout() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr("ERR (Client.Timeout exceeded while awaiting headers)");
        agent.exit(1);

        let err = supervisor.establish(5001).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_without_marker_is_crash() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr("ERR unknown flag: --no-autoupdate");
        agent.exit(1);

        match supervisor.establish(5001).await {
            Err(TunnelError::AgentCrashed { exit_code, output }) => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(output, "ERR unknown flag: --no-autoupdate");
            }
            other => panic!("expected AgentCrashed, got {:?}", other),
        }
        assert!(!supervisor.is_active());
        assert_eq!(agent.terminate_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_outside_last_ten_lines_is_crash() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr("context deadline exceeded");
        for i in 0..10 {
            agent.stderr(format!("later line {}", i));
        }
        agent.exit(2);

        match supervisor.establish(5001).await {
            Err(TunnelError::AgentCrashed { exit_code, .. }) => assert_eq!(exit_code, Some(2)),
            other => panic!("expected AgentCrashed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_mid_polling_is_not_a_timeout() {
        let (mut supervisor, agent) = supervisor();

        let dying = agent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            dying.stderr("ERR segfault");
            dying.exit(139);
        });

        let started = Instant::now();
        let err = supervisor.establish(5001).await.unwrap_err();

        assert!(matches!(err, TunnelError::AgentCrashed { exit_code: Some(139), .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_output_yields_placeholder() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr("INF Starting tunnel");

        let started = Instant::now();
        let url = supervisor.establish(5001).await.unwrap();

        assert_eq!(url.url, "https://unknown.trycloudflare.com");
        assert_eq!(
            url.status,
            UrlStatus::Placeholder(PlaceholderReason::NothingRecognized)
        );
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(supervisor.is_active());

        supervisor.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_plane_only_yields_vpn_placeholder() {
        let (mut supervisor, agent) = supervisor();
        agent.stderr("INF Requesting new quick Tunnel on https://api.trycloudflare.com");

        let url = supervisor.establish(5001).await.unwrap();

        assert_eq!(url.url, PLACEHOLDER_URL);
        assert_eq!(
            url.status,
            UrlStatus::Placeholder(PlaceholderReason::ControlPlaneOnly)
        );

        supervisor.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_mode_fails_and_stops_agent() {
        let (launcher, agent) = FakeLauncher::new();
        let config = TunnelConfig {
            strict: true,
            ..Default::default()
        };
        let mut supervisor = TunnelSupervisor::new(launcher, config);
        agent.stderr("https://api.trycloudflare.com");

        match supervisor.establish(5001).await {
            Err(TunnelError::NoUrlFound { control_plane_seen }) => assert!(control_plane_seen),
            other => panic!("expected NoUrlFound, got {:?}", other),
        }
        assert!(!supervisor.is_active());
        assert!(agent.has_exited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_establish_is_rejected() {
        let (mut supervisor, agent) = supervisor();
        agent.stdout(banner(URL));
        supervisor.establish(5001).await.unwrap();

        let err = supervisor.establish(5002).await.unwrap_err();
        assert!(matches!(err, TunnelError::TunnelAlreadyActive));
        assert_eq!(agent.launches(), 1);
        assert_eq!(supervisor.url().map(|u| u.url.as_str()), Some(URL));

        supervisor.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_again_after_teardown() {
        let (mut supervisor, agent) = supervisor();
        agent.stdout(banner(URL));
        supervisor.establish(5001).await.unwrap();
        supervisor.teardown().await;

        agent.stdout(banner("https://second-run.trycloudflare.com"));
        let url = supervisor.establish(5001).await.unwrap();
        assert_eq!(url.url, "https://second-run.trycloudflare.com");
        assert_eq!(agent.launches(), 2);

        supervisor.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_establishment() {
        let (launcher, agent) = FakeLauncher::new();
        let cancel = CancellationToken::new();
        let mut supervisor = TunnelSupervisor::new(launcher, TunnelConfig::default())
            .with_cancellation(cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = supervisor.establish(5001).await.unwrap_err();

        assert!(matches!(err, TunnelError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!supervisor.is_active());
        assert_eq!(agent.terminate_requests(), 1);
    }

    #[tokio::test]
    async fn test_teardown_without_tunnel_is_noop() {
        let (mut supervisor, agent) = supervisor();

        supervisor.teardown().await;
        supervisor.teardown().await;

        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(agent.terminate_requests(), 0);
        assert_eq!(agent.kill_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_twice_after_success() {
        let (mut supervisor, agent) = supervisor();
        agent.stdout(banner(URL));
        supervisor.establish(5001).await.unwrap();

        supervisor.teardown().await;
        supervisor.teardown().await;

        assert_eq!(agent.terminate_requests(), 1);
        assert_eq!(agent.kill_requests(), 0);
        assert!(agent.has_exited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_escalates_to_kill() {
        let (mut supervisor, agent) = supervisor();
        agent.stdout(banner(URL));
        agent.ignore_terminate();
        supervisor.establish(5001).await.unwrap();

        let started = Instant::now();
        supervisor.teardown().await;

        assert_eq!(agent.terminate_requests(), 1);
        assert_eq!(agent.kill_requests(), 1);
        assert!(agent.has_exited());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(!supervisor.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_abandons_unkillable_agent() {
        let (mut supervisor, agent) = supervisor();
        agent.stdout(banner(URL));
        agent.ignore_terminate();
        agent.ignore_kill();
        supervisor.establish(5001).await.unwrap();

        let started = Instant::now();
        supervisor.teardown().await;

        assert_eq!(agent.kill_requests(), 1);
        assert!(!agent.has_exited());
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(!supervisor.is_active());

        // Slot is cleared, so the stale handle is never touched again
        supervisor.teardown().await;
        assert_eq!(agent.kill_requests(), 1);
    }
}
