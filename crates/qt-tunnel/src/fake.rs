//! Scripted tunnel agent for tests
//!
//! `FakeLauncher` hands out `FakeProcess`es whose output and exit behaviour
//! are driven through a shared `FakeAgentHandle`.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use qt_core::TunnelError;
use tokio::sync::{mpsc, watch};

use crate::launcher::{AgentLauncher, LaunchedAgent};
use crate::process::{AgentExit, AgentProcess};
use crate::scanner::{LineScanner, StreamKind};

const FAKE_PID: u32 = 4242;

#[derive(Default)]
struct FakeState {
    pending_stdout: Vec<String>,
    pending_stderr: Vec<String>,
    stdout_tx: Option<mpsc::UnboundedSender<String>>,
    stderr_tx: Option<mpsc::UnboundedSender<String>>,
    exit: Option<AgentExit>,
    exit_tx: Option<watch::Sender<Option<AgentExit>>>,
    ignores_terminate: bool,
    ignores_kill: bool,
    launches: usize,
    launched_ports: Vec<u16>,
    terminate_requests: usize,
    kill_requests: usize,
}

impl FakeState {
    fn finish(&mut self, exit: AgentExit) {
        if self.exit.is_some() {
            return;
        }
        self.exit = Some(exit);
        // Closing the pipes mirrors a real process reaching EOF
        self.stdout_tx = None;
        self.stderr_tx = None;
        if let Some(tx) = &self.exit_tx {
            let _ = tx.send(Some(exit));
        }
    }
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Launcher producing scripted agents
#[derive(Clone)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

/// Test-side control over the fake agent
#[derive(Clone)]
pub struct FakeAgentHandle {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> (Self, FakeAgentHandle) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            FakeAgentHandle { state },
        )
    }
}

impl AgentLauncher for FakeLauncher {
    fn launch(&self, port: u16) -> Result<LaunchedAgent, TunnelError> {
        let mut state = lock(&self.state);
        // A previous run already ended; start the new one fresh
        if state.exit_tx.is_some() {
            state.exit = None;
        }
        state.launches += 1;
        state.launched_ports.push(port);

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        for line in state.pending_stdout.drain(..) {
            let _ = stdout_tx.send(line);
        }
        for line in state.pending_stderr.drain(..) {
            let _ = stderr_tx.send(line);
        }

        let (exit_tx, exit_rx) = watch::channel(state.exit);
        if state.exit.is_none() {
            state.stdout_tx = Some(stdout_tx);
            state.stderr_tx = Some(stderr_tx);
        }
        state.exit_tx = Some(exit_tx);

        Ok(LaunchedAgent {
            process: Box::new(FakeProcess {
                state: Arc::clone(&self.state),
                exit_rx,
            }),
            stdout: LineScanner::from_channel(StreamKind::Stdout, stdout_rx),
            stderr: LineScanner::from_channel(StreamKind::Stderr, stderr_rx),
        })
    }
}

impl FakeAgentHandle {
    /// Emit a line on stdout (queued until launch if not yet running)
    pub fn stdout(&self, line: impl Into<String>) {
        let mut state = lock(&self.state);
        let line = line.into();
        match &state.stdout_tx {
            Some(tx) => {
                let _ = tx.send(line);
            }
            None => state.pending_stdout.push(line),
        }
    }

    /// Emit a line on stderr (queued until launch if not yet running)
    pub fn stderr(&self, line: impl Into<String>) {
        let mut state = lock(&self.state);
        let line = line.into();
        match &state.stderr_tx {
            Some(tx) => {
                let _ = tx.send(line);
            }
            None => state.pending_stderr.push(line),
        }
    }

    /// Make the agent exit with `code`
    ///
    /// Called before the first launch, the agent exits as soon as it starts.
    pub fn exit(&self, code: i32) {
        lock(&self.state).finish(AgentExit { code: Some(code) });
    }

    /// Keep running after a graceful termination request
    pub fn ignore_terminate(&self) {
        lock(&self.state).ignores_terminate = true;
    }

    /// Keep running even after a forceful kill
    pub fn ignore_kill(&self) {
        lock(&self.state).ignores_kill = true;
    }

    pub fn launches(&self) -> usize {
        lock(&self.state).launches
    }

    pub fn launched_ports(&self) -> Vec<u16> {
        lock(&self.state).launched_ports.clone()
    }

    pub fn terminate_requests(&self) -> usize {
        lock(&self.state).terminate_requests
    }

    pub fn kill_requests(&self) -> usize {
        lock(&self.state).kill_requests
    }

    pub fn has_exited(&self) -> bool {
        lock(&self.state).exit.is_some()
    }
}

/// Scripted `AgentProcess`
pub struct FakeProcess {
    state: Arc<Mutex<FakeState>>,
    exit_rx: watch::Receiver<Option<AgentExit>>,
}

#[async_trait]
impl AgentProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        if lock(&self.state).exit.is_some() {
            None
        } else {
            Some(FAKE_PID)
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<AgentExit>> {
        Ok(lock(&self.state).exit)
    }

    fn terminate(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.terminate_requests += 1;
        if !state.ignores_terminate {
            state.finish(AgentExit { code: None });
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.kill_requests += 1;
        if !state.ignores_kill {
            state.finish(AgentExit { code: None });
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<AgentExit> {
        let exit = *self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::other("fake agent state dropped"))?;
        exit.ok_or_else(|| io::Error::other("fake agent exit missing"))
    }
}
