//! Agent output scanning
//!
//! Each output pipe of the agent is consumed by a reader task that forwards
//! complete lines over a channel. The supervisor drains whatever lines are
//! already available once per polling round, so a partially written line
//! never stalls the loop.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Provider domain every quick tunnel is assigned under
pub const TUNNEL_DOMAIN: &str = "trycloudflare.com";

/// The provider's API host. Never a tunnel endpoint.
pub const CONTROL_PLANE_HOST: &str = "api.trycloudflare.com";

/// Returned when no unique tunnel URL could be confirmed
pub const PLACEHOLDER_URL: &str = "https://unknown.trycloudflare.com";

const CONTROL_PLANE_URL: &str = "https://api.trycloudflare.com";

static TUNNEL_URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://[-a-zA-Z0-9.]+\.trycloudflare\.com").expect("Valid regex pattern")
});

/// Find the first tunnel URL in a line, skipping the control-plane host
pub fn match_url(line: &str) -> Option<String> {
    if !line.contains(TUNNEL_DOMAIN) {
        return None;
    }

    TUNNEL_URL_REGEX
        .find_iter(line)
        .map(|m| m.as_str())
        .find(|url| *url != CONTROL_PLANE_URL)
        .map(str::to_string)
}

/// Which agent pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Lines captured from both agent pipes during one establishment attempt
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    lines: Vec<String>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The last `n` lines, oldest first
    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.lines.len().saturating_sub(n);
        &self.lines[start..]
    }

    /// The last `n` lines joined with newlines
    pub fn tail_text(&self, n: usize) -> String {
        self.tail(n).join("\n")
    }

    /// Whether the control-plane host appeared anywhere in the output
    pub fn saw_control_plane(&self) -> bool {
        self.lines.iter().any(|line| line.contains(CONTROL_PLANE_HOST))
    }

    /// Rescan everything captured so far, ignoring lines that mention the
    /// control-plane host
    pub fn find_url(&self) -> Option<String> {
        self.lines
            .iter()
            .filter(|line| !line.contains(CONTROL_PLANE_HOST))
            .find_map(|line| match_url(line))
    }

    /// Lines that mention the tunnel domain but not the control plane
    pub fn candidate_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(String::as_str)
            .filter(|line| line.contains(TUNNEL_DOMAIN) && !line.contains(CONTROL_PLANE_HOST))
    }
}

/// Incremental, non-blocking view over one agent output pipe
pub struct LineScanner {
    stream: StreamKind,
    rx: mpsc::UnboundedReceiver<String>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl LineScanner {
    /// Spawn a reader task over `reader` and scan the lines it produces
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R>(stream: StreamKind, reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_line_reader(stream, reader, tx);
        Self {
            stream,
            rx,
            reader: Some(handle),
            closed: false,
        }
    }

    /// Scan lines delivered over an existing channel
    pub fn from_channel(stream: StreamKind, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            stream,
            rx,
            reader: None,
            closed: false,
        }
    }

    /// Whether the pipe has reached end of file and every line was consumed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Take every complete line available right now without waiting
    ///
    /// Lines are appended to `buffer` in arrival order.
    pub fn read_available_lines(&mut self, buffer: &mut OutputBuffer) -> Vec<String> {
        let mut lines = Vec::new();

        loop {
            match self.rx.try_recv() {
                Ok(line) => {
                    buffer.push(line.clone());
                    lines.push(line);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }

        lines
    }

    /// Read available lines and return the first accepted tunnel URL
    pub fn scan(&mut self, buffer: &mut OutputBuffer) -> Option<String> {
        self.read_available_lines(buffer)
            .iter()
            .find_map(|line| match_url(line))
    }

    /// Collect remaining lines until the pipe closes or `deadline` passes
    ///
    /// Used after the agent has exited so its last words reach the buffer.
    pub async fn drain_until_closed(&mut self, buffer: &mut OutputBuffer, deadline: Instant) {
        while !self.closed {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(line)) => buffer.push(line),
                Ok(None) => self.closed = true,
                Err(_) => {
                    tracing::debug!("Gave up draining agent {} after exit", self.stream);
                    break;
                }
            }
        }
    }
}

impl Drop for LineScanner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

/// Forward complete, trimmed, non-empty lines from `reader` to `tx`
///
/// Invalid UTF-8 is replaced rather than ending the stream.
fn spawn_line_reader<R>(
    stream: StreamKind,
    reader: R,
    tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    tracing::debug!("Agent {} reached EOF", stream);
                    break;
                }
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!(target: "qt_tunnel::agent", "[{}] {}", stream, line);
                    if tx.send(line.to_string()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Agent {} read error: {}", stream, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_match_url_in_agent_banner() {
        let line = "2024-01-01T00:00:00Z INF |  https://sharp-quiet-river-42.trycloudflare.com  |";
        assert_eq!(
            match_url(line),
            Some("https://sharp-quiet-river-42.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn test_match_url_rejects_control_plane() {
        assert_eq!(match_url("https://api.trycloudflare.com"), None);
        assert_eq!(
            match_url("ERR failed to request quick Tunnel: Post \"https://api.trycloudflare.com/tunnel\""),
            None
        );
    }

    #[test]
    fn test_match_url_skips_control_plane_before_real_url() {
        let line = "via https://api.trycloudflare.com got https://a.b-c.trycloudflare.com";
        assert_eq!(
            match_url(line),
            Some("https://a.b-c.trycloudflare.com".to_string())
        );
    }

    #[test]
    fn test_match_url_requires_https_and_domain() {
        assert_eq!(match_url("http://foo.trycloudflare.com"), None);
        assert_eq!(match_url("https://foo.example.com"), None);
        assert_eq!(match_url("https://.trycloudflare.com"), None);
        assert_eq!(match_url(""), None);
    }

    #[test]
    fn test_buffer_tail() {
        let mut buffer = OutputBuffer::new();
        for i in 0..15 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.tail(10).len(), 10);
        assert_eq!(buffer.tail(10)[0], "line 5");
        assert_eq!(buffer.tail(100).len(), 15);
        assert!(buffer.tail_text(2).ends_with("line 13\nline 14"));
    }

    #[test]
    fn test_buffer_rescan_ignores_control_plane_lines() {
        let mut buffer = OutputBuffer::new();
        buffer.push("requesting https://api.trycloudflare.com https://x.trycloudflare.com".into());
        assert!(buffer.saw_control_plane());
        assert_eq!(buffer.find_url(), None);

        buffer.push("Your tunnel: https://y.trycloudflare.com".into());
        assert_eq!(buffer.find_url(), Some("https://y.trycloudflare.com".to_string()));
        assert_eq!(buffer.candidate_lines().count(), 1);
    }

    #[tokio::test]
    async fn test_read_available_lines_does_not_block() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut scanner = LineScanner::from_channel(StreamKind::Stdout, rx);
        let mut buffer = OutputBuffer::new();

        assert!(scanner.read_available_lines(&mut buffer).is_empty());

        tx.send("one".to_string()).unwrap();
        tx.send("two".to_string()).unwrap();
        assert_eq!(scanner.read_available_lines(&mut buffer), vec!["one", "two"]);
        assert_eq!(buffer.lines(), ["one", "two"]);
        assert!(!scanner.is_closed());

        drop(tx);
        assert!(scanner.read_available_lines(&mut buffer).is_empty());
        assert!(scanner.is_closed());
    }

    #[tokio::test]
    async fn test_spawned_reader_splits_and_trims_lines() {
        let input: &[u8] = b"  starting  \n\nhttps://abc.trycloudflare.com\r\npartial";
        let mut scanner = LineScanner::spawn(StreamKind::Stderr, input);
        let mut buffer = OutputBuffer::new();

        scanner
            .drain_until_closed(&mut buffer, Instant::now() + Duration::from_secs(5))
            .await;

        assert!(scanner.is_closed());
        assert_eq!(
            buffer.lines(),
            ["starting", "https://abc.trycloudflare.com", "partial"]
        );
    }

    #[tokio::test]
    async fn test_scan_returns_first_accepted_url() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut scanner = LineScanner::from_channel(StreamKind::Stdout, rx);
        let mut buffer = OutputBuffer::new();

        tx.send("https://api.trycloudflare.com".to_string()).unwrap();
        tx.send("https://first.trycloudflare.com".to_string()).unwrap();
        tx.send("https://second.trycloudflare.com".to_string()).unwrap();

        assert_eq!(
            scanner.scan(&mut buffer),
            Some("https://first.trycloudflare.com".to_string())
        );
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_at_deadline() {
        let (_tx, rx) = mpsc::unbounded_channel::<String>();
        let mut scanner = LineScanner::from_channel(StreamKind::Stdout, rx);
        let mut buffer = OutputBuffer::new();

        scanner
            .drain_until_closed(&mut buffer, Instant::now() + Duration::from_millis(500))
            .await;

        assert!(!scanner.is_closed());
        assert!(buffer.is_empty());
    }
}
