//! Shell task runner.
//!
//! Runs a single command line through a shell interpreter (`<shell> -c <cmd>`),
//! optionally feeding bytes to its stdin, and reports the exit status. The
//! interpreter is picked from an explicit, ordered candidate list so callers
//! and tests can pin it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::Lifetime;

/// Interpreters probed by default, most capable first
pub const DEFAULT_SHELLS: &[&str] = &["bash", "sh"];

/// Failure running a shell task
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no suitable shell found in PATH (tried {})", .tried.join(", "))]
    NoShellFound { tried: Vec<String> },

    #[error("failed to start {}: {source}", .shell.display())]
    Launch {
        shell: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exit status {code}")]
    Exited { code: i32 },

    #[error("signal: {signal}")]
    Signaled { signal: String },

    #[error("killed: task timed out")]
    TimedOut,

    #[error("killed: task cancelled")]
    Cancelled,

    #[error("failed waiting for process: {0}")]
    Wait(#[source] std::io::Error),
}

impl RunError {
    /// Process exit code for this failure.
    ///
    /// `0` when the process never ran; `-1` when it was killed or ended by a
    /// signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoShellFound { .. } | Self::Launch { .. } | Self::Wait(_) => 0,
            Self::Exited { code } => *code,
            Self::Signaled { .. } | Self::TimedOut | Self::Cancelled => -1,
        }
    }
}

/// In-memory capture buffer shared between the runner and the caller
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything captured so far
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    fn extend(&self, bytes: &[u8]) {
        if let Ok(mut buf) = self.0.lock() {
            buf.extend_from_slice(bytes);
        }
    }
}

/// Where a child's stdout or stderr goes
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Share this process's own stream
    #[default]
    Inherit,

    /// Discard
    Null,

    /// Capture into a buffer
    Buffer(SharedBuffer),
}

impl OutputSink {
    fn stdio(&self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
            Self::Buffer(_) => Stdio::piped(),
        }
    }
}

/// A command to run
#[derive(Debug, Clone, Default)]
pub struct ShellTask {
    /// The command line, passed verbatim to the shell
    pub cmd: String,

    /// Working directory; `None` runs in the current directory
    pub dir: Option<PathBuf>,

    /// Bytes written to the child's stdin; stdin is null when absent
    pub stdin: Option<Vec<u8>>,

    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl ShellTask {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = sink;
        self
    }
}

/// Runs [`ShellTask`]s through the first interpreter found on `PATH`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shells: Vec<String>,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    /// Runner probing [`DEFAULT_SHELLS`]
    pub fn new() -> Self {
        Self::with_shells(DEFAULT_SHELLS.iter().copied())
    }

    /// Runner probing the given interpreters in order (names or paths)
    pub fn with_shells<I, S>(shells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shells: shells.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shells(&self) -> &[String] {
        &self.shells
    }

    /// Resolve the first available interpreter
    pub fn find_shell(&self) -> Result<PathBuf, RunError> {
        self.shells
            .iter()
            .find_map(|candidate| which::which(candidate).ok())
            .ok_or_else(|| RunError::NoShellFound {
                tried: self.shells.clone(),
            })
    }

    /// Run the task to completion.
    ///
    /// If `lifetime` is cancelled (or its deadline passes) first, the child is
    /// killed and [`RunError::TimedOut`] or [`RunError::Cancelled`] returned.
    pub async fn run(&self, lifetime: &Lifetime, task: ShellTask) -> Result<(), RunError> {
        let shell = self.find_shell()?;

        let mut cmd = Command::new(&shell);
        cmd.arg("-c")
            .arg(&task.cmd)
            .stdin(if task.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(task.stdout.stdio())
            .stderr(task.stderr.stdio())
            .kill_on_drop(true);

        if let Some(dir) = task.dir.as_deref().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RunError::Launch {
            shell: shell.clone(),
            source,
        })?;

        debug!(shell = %shell.display(), cmd = %task.cmd, pid = ?child.id(), "started task process");

        if let (Some(mut stdin), Some(input)) = (child.stdin.take(), task.stdin) {
            tokio::spawn(async move {
                // The child may exit without reading its input.
                if let Err(e) = stdin.write_all(&input).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        debug!(error = %e, "failed writing task stdin");
                    }
                }
            });
        }

        let mut copiers = Vec::new();
        if let OutputSink::Buffer(buf) = &task.stdout {
            copiers.extend(child.stdout.take().map(|out| capture(out, buf.clone())));
        }
        if let OutputSink::Buffer(buf) = &task.stderr {
            copiers.extend(child.stderr.take().map(|err| capture(err, buf.clone())));
        }

        let interrupted = || {
            if lifetime.deadline_exceeded() {
                RunError::TimedOut
            } else {
                RunError::Cancelled
            }
        };

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(RunError::Wait)?;

                // A backgrounded grandchild can hold the pipes open after the
                // shell exits; the lifetime still bounds the drain.
                let drained = async {
                    for copier in copiers.iter_mut() {
                        let _ = copier.await;
                    }
                };
                tokio::select! {
                    _ = drained => {}
                    _ = lifetime.cancelled() => {
                        for copier in &copiers {
                            copier.abort();
                        }
                        return Err(interrupted());
                    }
                }

                if status.success() {
                    return Ok(());
                }

                match status.code() {
                    Some(code) => Err(RunError::Exited { code }),
                    None => Err(RunError::Signaled { signal: signal_name(&status) }),
                }
            }

            _ = lifetime.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(cmd = %task.cmd, error = %e, "failed to kill task process");
                }
                for copier in &copiers {
                    copier.abort();
                }

                Err(interrupted())
            }
        }
    }
}

fn capture<R>(mut reader: R, buf: SharedBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend(&chunk[..n]),
            }
        }
    })
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(9) => "killed".to_string(),
        Some(15) => "terminated".to_string(),
        Some(n) => n.to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: &std::process::ExitStatus) -> String {
    "unknown".to_string()
}
