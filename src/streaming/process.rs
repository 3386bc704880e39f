use crate::error::{BackendError, Result, VcamError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const STDERR_TAIL_LINES: usize = 64;
const KILL_GRACE: Duration = Duration::from_secs(1);

/// How a child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// None when terminated by a signal
    pub code: Option<i32>,
}

/// A spawned child with explicit start/stop/liveness handling.
///
/// A reaper task owns the `Child` and publishes its exit on a watch channel,
/// so liveness checks never block and any number of tasks can await the exit.
pub struct ManagedProcess {
    program: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ManagedProcess {
    /// Spawn `program` with piped stdin and captured stderr
    pub fn start(program: &str, args: &[String]) -> Result<Self> {
        debug!("Spawning {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::ChildProcess {
                program: program.to_string(),
                message: format!("spawn failed: {}", e),
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            let label = program.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!("[{}] {}", label, line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let label = program.to_string();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!("Failed to wait for {}: {}", label, e);
                    ProcessExit { code: None }
                }
            };
            debug!("{} exited with {:?}", label, exit.code);
            let _ = exit_tx.send(Some(exit));
        });

        info!("Started {} (pid {:?})", program, pid);

        Ok(Self {
            program: program.to_string(),
            pid,
            stdin,
            exit_rx,
            stderr_tail,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Hand stdin to the writer; closing it signals end of input
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit code once exited; None while running or when killed by a signal
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_rx.borrow().and_then(|exit| exit.code)
    }

    /// Receiver that yields Some(exit) once the child is gone
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Wait for exit up to `limit`
    pub async fn wait_exit(&self, limit: Duration) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        let exit = match timeout(limit, rx.wait_for(|exit| exit.is_some())).await {
            Ok(Ok(exit)) => *exit,
            _ => *self.exit_rx.borrow(),
        };
        exit
    }

    /// First stderr line containing any pattern (case-insensitive)
    pub fn stderr_match(&self, patterns: &[&str]) -> Option<String> {
        let tail = self.stderr_tail.lock();
        tail.iter()
            .find(|line| {
                let lower = line.to_lowercase();
                patterns.iter().any(|p| lower.contains(p))
            })
            .cloned()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    /// Close stdin, SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        self.stdin.take();

        if !self.is_alive() {
            return Ok(());
        }

        self.signal(Signal::Terminate);
        if self.wait_exit(grace).await.is_some() {
            info!("{} stopped", self.program);
            return Ok(());
        }

        warn!(
            "{} did not exit within {}ms, killing",
            self.program,
            grace.as_millis()
        );
        self.signal(Signal::Kill);
        if self.wait_exit(KILL_GRACE).await.is_some() {
            return Ok(());
        }

        Err(VcamError::ShutdownTimeout {
            component: self.program.clone(),
            timeout_ms: (grace + KILL_GRACE).as_millis() as u64,
        })
    }

    fn signal(&self, signal: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        send_signal(pid, signal);
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            self.signal(Signal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        debug!("kill({}, {:?}) failed: {}", pid, signal, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    // kill_on_drop on the reaper's Child covers termination here
    debug!("Signal {:?} to {} not supported on this platform", signal, pid);
}
