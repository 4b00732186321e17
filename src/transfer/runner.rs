//! Subprocess execution for transfer invocations.
//!
//! Provides:
//! - `ToolLocator` / `SearchPath`: find the transfer binary on `PATH`
//! - `CommandRunner` / `ShellRunner`: run an invocation through `sh -c`,
//!   mirroring output with `[CMD] ` / `[CMD-ERR] ` prefixes while capturing it

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::transfer::command::{Invocation, PASSWORD_ENV};

/// Prefix for mirrored child stdout lines.
pub const STDOUT_PREFIX: &str = "[CMD] ";

/// Prefix for mirrored child stderr lines.
pub const STDERR_PREFIX: &str = "[CMD-ERR] ";

// ── Tool lookup ─────────────────────────────────────────────────────

/// Resolves an executable name to a path.
pub trait ToolLocator: Send + Sync {
    fn locate(&self, tool: &str) -> Option<PathBuf>;
}

/// `PATH`-style search over a list of directories.
#[derive(Debug, Clone)]
pub struct SearchPath {
    dirs: Option<OsString>,
}

impl SearchPath {
    /// Search the process `PATH`.
    pub fn from_env() -> Self {
        Self {
            dirs: std::env::var_os("PATH"),
        }
    }

    /// Search an explicit `PATH`-formatted value.
    pub fn new(dirs: impl Into<OsString>) -> Self {
        Self {
            dirs: Some(dirs.into()),
        }
    }
}

impl ToolLocator for SearchPath {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        let dirs = self.dirs.as_ref()?;
        std::env::split_paths(dirs)
            .map(|dir| dir.join(tool))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ── Running ─────────────────────────────────────────────────────────

/// Captured result of a process that started and exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one invocation to completion.
///
/// `Err` means the process could not be started at all; a process that ran
/// and failed is an `Ok` with a non-zero `exit_code`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<RunOutput, TransferError>;
}

/// Runs invocations through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    interpreter: PathBuf,
    mirror: bool,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            interpreter: PathBuf::from("sh"),
            mirror: true,
        }
    }

    /// Use a different interpreter binary.
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Capture output without mirroring it to this process's streams.
    pub fn quiet(mut self) -> Self {
        self.mirror = false;
        self
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, invocation: &Invocation) -> Result<RunOutput, TransferError> {
        let mut command = Command::new(&self.interpreter);
        command
            .arg("-c")
            .arg(&invocation.command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref password) = invocation.password {
            command.env(PASSWORD_ENV, password.expose_secret());
        }

        #[cfg(unix)]
        if let Some(run_as) = invocation.run_as {
            command.uid(run_as.uid).gid(run_as.gid);
        }

        let mut child = command.spawn().map_err(|e| TransferError::SpawnFailed {
            mode: invocation.mode.label().into(),
            reason: e.to_string(),
        })?;

        debug!(mode = %invocation.mode, pid = ?child.id(), "Transfer process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mirror = self.mirror;

        let (stdout, stderr, status) = tokio::join!(
            pump(stdout, STDOUT_PREFIX, mirror.then(tokio::io::stdout)),
            pump(stderr, STDERR_PREFIX, mirror.then(tokio::io::stderr)),
            child.wait(),
        );

        Ok(RunOutput {
            exit_code: status?.code(),
            stdout: stdout?,
            stderr: stderr?,
        })
    }
}

/// Read a child stream line by line, optionally echoing each line with a
/// prefix, and return everything read.
///
/// Only read errors end the pump. If the echo sink fails it is dropped and
/// reading continues, so the child never sees a closed pipe.
async fn pump<R, W>(
    reader: Option<R>,
    prefix: &str,
    mut sink: Option<W>,
) -> Result<String, std::io::Error>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };

    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);

        if let Some(ref mut out) = sink {
            let mut echoed = String::with_capacity(prefix.len() + text.len() + 1);
            echoed.push_str(prefix);
            echoed.push_str(&text);
            if !echoed.ends_with('\n') {
                echoed.push('\n');
            }
            let written = match out.write_all(echoed.as_bytes()).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(prefix = %prefix.trim_end(), error = %e, "Output mirror failed, capturing only");
                sink = None;
            }
        }

        captured.push_str(&text);
    }

    Ok(captured)
}
