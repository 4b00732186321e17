//! lftp command construction.
//!
//! Two invocations are built per job against the same destination:
//! - directory mode: `mirror -c` with the configured parallelism
//! - file mode: a single segmented `pget`
//!
//! `location` arrives from the broker and is untrusted. Values are quoted
//! twice: once for lftp's own command language (inside `-e`) and once for
//! `sh -c`. The server password never appears on the command line; lftp reads
//! it from `LFTP_PASSWORD` via `--env-password`.

use std::fmt;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};

use crate::config::{DestinationConfig, RunAs};
use crate::error::TransferError;

/// Binary looked up on `PATH`.
pub const TRANSFER_TOOL: &str = "lftp";

/// Environment variable lftp reads with `--env-password`.
pub const PASSWORD_ENV: &str = "LFTP_PASSWORD";

/// Transfer strategy. Directory mode is always tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Directory,
    File,
}

impl TransferMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::File => "file",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One fully built command, ready for `sh -c`.
#[derive(Debug)]
pub struct Invocation {
    pub mode: TransferMode,
    /// Argument to `sh -c`.
    pub command_line: String,
    /// Passed to the child as `LFTP_PASSWORD`, never on the command line.
    pub password: Option<SecretString>,
    pub run_as: Option<RunAs>,
}

/// Build the directory-mode and file-mode invocations, in that order.
pub fn build_invocations(
    tool: &Path,
    destination: &Path,
    location: &str,
    config: &DestinationConfig,
) -> Result<[Invocation; 2], TransferError> {
    let destination = destination.to_string_lossy();
    reject_control_chars("location", location)?;
    reject_control_chars("destination", &destination)?;

    let lcd = format!("lcd {}", lftp_quote(&destination));
    let threads = config.lftp.threads;
    let segments = config.lftp.segments;

    let mirror = format!(
        "set sftp:auto-confirm yes; {lcd}; mirror -c --parallel={threads} --use-pget-n={segments} {}; quit",
        lftp_quote(location)
    );
    let pget = format!(
        "set sftp:auto-confirm yes; {lcd}; pget -n {threads} {}; quit",
        lftp_quote(location)
    );

    Ok([
        invocation(TransferMode::Directory, tool, &mirror, config)?,
        invocation(TransferMode::File, tool, &pget, config)?,
    ])
}

fn invocation(
    mode: TransferMode,
    tool: &Path,
    script: &str,
    config: &DestinationConfig,
) -> Result<Invocation, TransferError> {
    let server = &config.server_info;
    reject_control_chars("server host", &server.host)?;
    reject_control_chars("server username", &server.username)?;

    let mut parts = vec![shell_quote(&tool.to_string_lossy())];

    let password = if server.username.is_empty() {
        None
    } else {
        parts.push("-u".into());
        parts.push(shell_quote(&server.username));
        parts.push("--env-password".into());
        Some(SecretString::from(server.password.expose_secret().to_string()))
    };

    parts.push("-e".into());
    parts.push(shell_quote(script));
    parts.push(shell_quote(&format!("sftp://{}/", server.host)));

    Ok(Invocation {
        mode,
        command_line: parts.join(" "),
        password,
        run_as: config.run_as,
    })
}

/// Quote a value for POSIX `sh`: wrap in single quotes, and close, escape,
/// reopen around any embedded single quote.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote a value as a single word of an lftp command.
pub fn lftp_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

// CR and LF end an lftp command inside a quoted word, and NUL truncates the
// argument. Other control characters such as tab are quoted like any text.
fn reject_control_chars(what: &str, value: &str) -> Result<(), TransferError> {
    if value.contains(['\n', '\r', '\0']) {
        return Err(TransferError::UnsafeArgument { what: what.into() });
    }
    Ok(())
}
