//! Child process abstraction
//!
//! The supervisor only needs to poll, signal and reap the agent, so it talks
//! to an `AgentProcess` rather than a concrete child handle. Tests substitute
//! a scripted fake.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::process::Child;

/// How the agent process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    /// Exit code, `None` if terminated by a signal
    pub code: Option<i32>,
}

impl fmt::Display for AgentExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A running tunnel agent
#[async_trait]
pub trait AgentProcess: Send {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    /// Check for exit without blocking
    fn try_wait(&mut self) -> io::Result<Option<AgentExit>>;

    /// Ask the agent to shut down (SIGTERM on Unix)
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully kill the agent without waiting for it
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for the agent to exit
    async fn wait(&mut self) -> io::Result<AgentExit>;
}

/// `AgentProcess` backed by a tokio child process
pub struct TokioAgentProcess {
    child: Child,
}

impl TokioAgentProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl AgentProcess for TokioAgentProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<AgentExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| AgentExit {
                code: status.code(),
            }))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        // Already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        send_terminate(pid)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        // No graceful signal available; fall back to kill
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    async fn wait(&mut self) -> io::Result<AgentExit> {
        let status = self.child.wait().await?;
        Ok(AgentExit {
            code: status.code(),
        })
    }
}

/// Send SIGTERM to `pid`
///
/// A process that no longer exists (ESRCH) counts as success.
#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
