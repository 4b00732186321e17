//! Transfer executor: resolves a destination and fetches with fallback.
//!
//! Flow for one job:
//! 1. Routing code → destination directory (job fails if unmapped)
//! 2. `lftp` lookup on `PATH` (job fails if absent, nothing is spawned)
//! 3. Directory mode (`mirror`)
//! 4. On a non-zero exit only: file mode (`pget`), exactly once
//!
//! A directory mirror of a path that is really a single file exits non-zero,
//! which is why the second attempt is file mode and not a plain retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::DestinationConfig;
use crate::error::TransferError;
use crate::transfer::command::{TRANSFER_TOOL, TransferMode, build_invocations};
use crate::transfer::runner::{CommandRunner, RunOutput, SearchPath, ShellRunner, ToolLocator};

/// Final status of a transfer that got as far as running the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Succeeded,
    /// Both modes ran and the last one exited with this code
    /// (`None` when killed by a signal).
    Failed { exit_code: Option<i32> },
}

/// Result reported for one job.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Mode of the last attempt.
    pub mode: TransferMode,
    pub status: TransferStatus,
    /// Number of subprocesses run (1 or 2).
    pub attempts: u8,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl TransferOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TransferStatus::Succeeded
    }
}

/// Builds and runs transfer invocations for resolved routing codes.
pub struct TransferExecutor {
    destinations: DestinationConfig,
    runner: Arc<dyn CommandRunner>,
    locator: Arc<dyn ToolLocator>,
}

impl TransferExecutor {
    pub fn new(
        destinations: DestinationConfig,
        runner: Arc<dyn CommandRunner>,
        locator: Arc<dyn ToolLocator>,
    ) -> Self {
        Self {
            destinations,
            runner,
            locator,
        }
    }

    /// Executor backed by `sh -c` and the process `PATH`.
    pub fn system(destinations: DestinationConfig) -> Self {
        Self::new(
            destinations,
            Arc::new(ShellRunner::new()),
            Arc::new(SearchPath::from_env()),
        )
    }

    /// Fetch `location` into the directory mapped to `code`.
    pub async fn transfer(
        &self,
        code: &str,
        location: &str,
    ) -> Result<TransferOutcome, TransferError> {
        let start = Instant::now();

        let destination = self
            .destinations
            .destination(code)
            .ok_or_else(|| TransferError::NoDestination { code: code.into() })?;

        let Some(tool) = self.locator.locate(TRANSFER_TOOL) else {
            error!(tool = TRANSFER_TOOL, "Transfer tool does not exist in PATH");
            return Err(TransferError::ToolMissing {
                tool: TRANSFER_TOOL.into(),
            });
        };
        debug!(tool = %tool.display(), "Transfer tool found");

        let [directory, file] =
            build_invocations(&tool, destination, location, &self.destinations)?;

        info!(
            code = %code,
            destination = %destination.display(),
            location = %location,
            "Starting directory-mode transfer"
        );
        let first = self.runner.run(&directory).await?;
        if first.success() {
            info!(location = %location, "Directory-mode transfer succeeded");
            return Ok(outcome(TransferMode::Directory, first, 1, start));
        }

        warn!(
            location = %location,
            exit_code = ?first.exit_code,
            "Directory-mode transfer failed, retrying as a single file"
        );
        let second = self.runner.run(&file).await?;
        if second.success() {
            info!(location = %location, "File-mode transfer succeeded");
        } else {
            error!(
                location = %location,
                exit_code = ?second.exit_code,
                "File-mode transfer failed, giving up"
            );
        }
        Ok(outcome(TransferMode::File, second, 2, start))
    }
}

fn outcome(mode: TransferMode, output: RunOutput, attempts: u8, start: Instant) -> TransferOutcome {
    let status = if output.success() {
        TransferStatus::Succeeded
    } else {
        TransferStatus::Failed {
            exit_code: output.exit_code,
        }
    };

    TransferOutcome {
        mode,
        status,
        attempts,
        stdout: output.stdout,
        stderr: output.stderr,
        elapsed: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::*;
    use crate::config::{LftpConfig, ServerInfo};
    use crate::transfer::command::Invocation;

    /// Replays scripted results and records what was run.
    struct ScriptedRunner {
        results: Mutex<VecDeque<Result<RunOutput, TransferError>>>,
        calls: Mutex<Vec<(TransferMode, String)>>,
    }

    impl ScriptedRunner {
        fn new(results: Vec<Result<RunOutput, TransferError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn modes(&self) -> Vec<TransferMode> {
            self.calls.lock().unwrap().iter().map(|(m, _)| *m).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> Result<RunOutput, TransferError> {
            self.calls
                .lock()
                .unwrap()
                .push((invocation.mode, invocation.command_line.clone()));
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .expect("runner called more times than scripted")
        }
    }

    struct FixedLocator(Option<PathBuf>);

    impl ToolLocator for FixedLocator {
        fn locate(&self, _tool: &str) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    fn exited(code: i32) -> Result<RunOutput, TransferError> {
        Ok(RunOutput {
            exit_code: Some(code),
            stdout: format!("out {code}"),
            stderr: String::new(),
        })
    }

    fn destinations() -> DestinationConfig {
        DestinationConfig {
            code_destinations: HashMap::from([("tv".to_string(), PathBuf::from("/downloads/tv"))]),
            lftp: LftpConfig::default(),
            server_info: ServerInfo {
                host: "seedbox".into(),
                username: "u".into(),
                password: SecretString::from("p".to_string()),
            },
            run_as: None,
        }
    }

    fn executor(runner: Arc<ScriptedRunner>, tool: Option<&str>) -> TransferExecutor {
        TransferExecutor::new(
            destinations(),
            runner,
            Arc::new(FixedLocator(tool.map(PathBuf::from))),
        )
    }

    #[tokio::test]
    async fn directory_success_skips_file_mode() {
        let runner = ScriptedRunner::new(vec![exited(0)]);
        let outcome = executor(runner.clone(), Some("/usr/bin/lftp"))
            .transfer("TV", "/remote/show")
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.mode, TransferMode::Directory);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.stdout, "out 0");
        assert_eq!(runner.modes(), vec![TransferMode::Directory]);
    }

    #[tokio::test]
    async fn non_zero_directory_exit_falls_back_to_file_once() {
        let runner = ScriptedRunner::new(vec![exited(1), exited(0)]);
        let outcome = executor(runner.clone(), Some("/usr/bin/lftp"))
            .transfer("tv", "/remote/movie.mkv")
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.mode, TransferMode::File);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(runner.modes(), vec![TransferMode::Directory, TransferMode::File]);
    }

    #[tokio::test]
    async fn both_modes_failing_reports_failure_without_third_attempt() {
        let runner = ScriptedRunner::new(vec![exited(1), exited(7)]);
        let outcome = executor(runner.clone(), Some("/usr/bin/lftp"))
            .transfer("tv", "/remote/missing")
            .await
            .unwrap();

        assert_eq!(outcome.status, TransferStatus::Failed { exit_code: Some(7) });
        assert_eq!(runner.modes().len(), 2);
    }

    #[tokio::test]
    async fn killed_by_signal_counts_as_failure() {
        let runner = ScriptedRunner::new(vec![
            Ok(RunOutput::default()),
            Ok(RunOutput::default()),
        ]);
        let outcome = executor(runner.clone(), Some("/usr/bin/lftp"))
            .transfer("tv", "/remote/x")
            .await
            .unwrap();

        assert_eq!(outcome.status, TransferStatus::Failed { exit_code: None });
        assert_eq!(runner.modes().len(), 2);
    }

    #[tokio::test]
    async fn spawn_failure_does_not_fall_back() {
        let runner = ScriptedRunner::new(vec![Err(TransferError::SpawnFailed {
            mode: "directory".into(),
            reason: "exec format error".into(),
        })]);
        let err = executor(runner.clone(), Some("/usr/bin/lftp"))
            .transfer("tv", "/remote/x")
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::SpawnFailed { .. }));
        assert_eq!(runner.modes(), vec![TransferMode::Directory]);
    }

    #[tokio::test]
    async fn missing_tool_runs_nothing() {
        let runner = ScriptedRunner::new(vec![]);
        let err = executor(runner.clone(), None)
            .transfer("tv", "/remote/x")
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::ToolMissing { .. }));
        assert!(runner.modes().is_empty());
    }

    #[tokio::test]
    async fn unmapped_code_is_a_job_error() {
        let runner = ScriptedRunner::new(vec![]);
        let err = executor(runner.clone(), Some("/usr/bin/lftp"))
            .transfer("books", "/remote/x")
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::NoDestination { ref code } if code == "books"));
        assert!(runner.modes().is_empty());
    }

    #[tokio::test]
    async fn invocations_target_resolved_destination() {
        let runner = ScriptedRunner::new(vec![exited(2), exited(0)]);
        executor(runner.clone(), Some("/opt/bin/lftp"))
            .transfer("tv", "/remote/x")
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        for (_, line) in calls.iter() {
            assert!(line.starts_with("'/opt/bin/lftp'"));
            assert!(line.contains("lcd \"/downloads/tv\""));
        }
    }
}
