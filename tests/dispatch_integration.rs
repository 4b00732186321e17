//! End-to-end tests for the dispatch pipeline.
//!
//! Jobs go through the real queue, rules engine, and dispatcher. Transfers run
//! either against a stub runner (for ordering and single-flight checks) or
//! through `sh` against a fake `lftp` script in a temp dir.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use q4d::config::{DestinationConfig, LftpConfig, ServerInfo};
use q4d::error::{DispatchError, TransferError};
use q4d::pipeline::{ConcurrentQueue, Dispatcher, Job, RoutingConfig, RoutingRule, RulesEngine};
use q4d::transfer::{
    CommandRunner, Invocation, RunOutput, SearchPath, ShellRunner, ToolLocator, TransferExecutor,
    TransferMode, TransferStatus,
};

/// Maximum time any test waits for the dispatcher.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn destinations(dir: &Path) -> DestinationConfig {
    DestinationConfig {
        code_destinations: HashMap::from([
            ("c".to_string(), dir.join("comics")),
            ("v".to_string(), dir.join("video")),
        ]),
        lftp: LftpConfig {
            threads: 2,
            segments: 4,
        },
        server_info: ServerInfo {
            host: "seedbox.example".into(),
            username: "seed".into(),
            password: SecretString::from("hunter2".to_string()),
        },
        run_as: None,
    }
}

fn rules() -> RulesEngine {
    RulesEngine::new(&RoutingConfig {
        default_code: "V".into(),
        code_conditions: vec![RoutingRule::new("name", "in", "bar", "C")],
    })
}

fn job(name: &str, location: &str) -> Job {
    Job {
        name: name.into(),
        location: location.into(),
        ..Job::default()
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatcher did not finish in time");
}

// ── Stub runner ─────────────────────────────────────────────────────

/// Sleeps for each invocation and tracks how many ran at once.
#[derive(Default)]
struct SlowRunner {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<(TransferMode, String)>>,
}

#[async_trait]
impl CommandRunner for SlowRunner {
    async fn run(&self, invocation: &Invocation) -> Result<RunOutput, TransferError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;
        self.seen
            .lock()
            .unwrap()
            .push((invocation.mode, invocation.command_line.clone()));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Directory mode "fails" for anything that looks like a single file.
        let exit_code = match invocation.mode {
            TransferMode::Directory if invocation.command_line.contains(".mkv") => 1,
            _ => 0,
        };
        Ok(RunOutput {
            exit_code: Some(exit_code),
            ..RunOutput::default()
        })
    }
}

struct Located;

impl ToolLocator for Located {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        Some(PathBuf::from("/usr/bin").join(tool))
    }
}

#[tokio::test]
async fn deep_queue_still_runs_one_transfer_at_a_time_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(SlowRunner::default());
    let executor = TransferExecutor::new(destinations(dir.path()), runner.clone(), Arc::new(Located));

    let queue = Arc::new(ConcurrentQueue::new());
    for i in 0..5 {
        queue.enqueue(job(&format!("foobar-{i}"), &format!("/remote/dir-{i}")));
    }
    queue.enqueue(job("single", "/remote/film.mkv"));

    let dispatcher = Dispatcher::new(Arc::clone(&queue), rules(), executor)
        .with_tick(Duration::from_millis(1));
    let stats = dispatcher.stats();
    let handle = dispatcher.start();

    wait_for(|| stats.processed() == 6).await;
    handle.shutdown().await.unwrap();

    assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(stats.succeeded(), 6);

    let seen = runner.seen.lock().unwrap();
    // Five directory runs plus directory + file for the .mkv.
    assert_eq!(seen.len(), 7);
    for (i, (mode, line)) in seen.iter().take(5).enumerate() {
        assert_eq!(*mode, TransferMode::Directory);
        assert!(line.contains(&format!("/remote/dir-{i}")));
        assert!(line.contains("comics"));
    }
    assert_eq!(seen[5].0, TransferMode::Directory);
    assert_eq!(seen[6].0, TransferMode::File);
    assert!(seen[6].1.contains("video"));
}

#[tokio::test]
async fn missing_tool_fails_job_without_running_anything() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(SlowRunner::default());
    let empty_path = tempfile::tempdir().unwrap();
    let executor = TransferExecutor::new(
        destinations(dir.path()),
        runner.clone(),
        Arc::new(SearchPath::new(empty_path.path())),
    );

    let dispatcher = Dispatcher::new(Arc::new(ConcurrentQueue::new()), rules(), executor);
    dispatcher.queue().enqueue(job("foobar", "/remote/x"));

    let err = dispatcher.tick_once().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transfer {
            source: TransferError::ToolMissing { .. },
            ..
        }
    ));
    assert!(runner.seen.lock().unwrap().is_empty());
    assert_eq!(dispatcher.stats().failed(), 1);
}

// ── Real subprocess ─────────────────────────────────────────────────

/// Fake lftp: logs its arguments and password, fails `mirror` for paths
/// ending in `.mkv`, succeeds otherwise.
fn install_fake_lftp(bin: &Path, log: &Path) {
    let script = format!(
        "#!/bin/sh\n\
         printf '%s\\n' \"$*\" >> '{log}'\n\
         printf 'password=%s\\n' \"$LFTP_PASSWORD\" >> '{log}'\n\
         case \"$*\" in\n\
           *mirror*.mkv*) echo 'mirror: not a directory' >&2; exit 1 ;;\n\
         esac\n\
         echo 'transfer done'\n",
        log = log.display()
    );
    let path = bin.join("lftp");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn shell_executor(work: &Path, bin: &Path) -> TransferExecutor {
    TransferExecutor::new(
        destinations(work),
        Arc::new(ShellRunner::new().quiet()),
        Arc::new(SearchPath::new(bin)),
    )
}

#[tokio::test]
async fn real_shell_falls_back_to_file_mode() {
    let work = tempfile::tempdir().unwrap();
    let bin = tempfile::tempdir().unwrap();
    let log = work.path().join("lftp.log");
    install_fake_lftp(bin.path(), &log);

    let dispatcher = Dispatcher::new(
        Arc::new(ConcurrentQueue::new()),
        rules(),
        shell_executor(work.path(), bin.path()),
    );
    dispatcher.queue().enqueue(job("some film", "/remote/film.mkv"));

    let outcome = dispatcher.tick_once().await.unwrap().unwrap();
    assert_eq!(outcome.status, TransferStatus::Succeeded);
    assert_eq!(outcome.mode, TransferMode::File);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.stdout, "transfer done\n");

    let logged = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = logged.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].contains("mirror -c --parallel=2 --use-pget-n=4"));
    assert!(lines[2].contains("pget -n 2"));
    assert_eq!(lines[1], "password=hunter2");
    assert!(!lines[0].contains("hunter2"));
}

#[tokio::test]
async fn real_shell_directory_success_runs_once() {
    let work = tempfile::tempdir().unwrap();
    let bin = tempfile::tempdir().unwrap();
    let log = work.path().join("lftp.log");
    install_fake_lftp(bin.path(), &log);

    let outcome = shell_executor(work.path(), bin.path())
        .transfer("C", "/remote/Comics Pack")
        .await
        .unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.mode, TransferMode::Directory);
    let logged = std::fs::read_to_string(&log).unwrap();
    assert_eq!(logged.lines().count(), 2);
    assert!(logged.contains("\"/remote/Comics Pack\""));
}

#[tokio::test]
async fn hostile_location_cannot_reach_the_shell() {
    let work = tempfile::tempdir().unwrap();
    let bin = tempfile::tempdir().unwrap();
    let log = work.path().join("lftp.log");
    install_fake_lftp(bin.path(), &log);

    let marker = work.path().join("pwned");
    let location = format!("x'; touch '{}'; echo '$(touch {})", marker.display(), marker.display());

    let outcome = shell_executor(work.path(), bin.path())
        .transfer("V", &location)
        .await
        .unwrap();

    assert!(outcome.succeeded());
    assert!(!marker.exists(), "location escaped its quoting");

    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(logged.contains(&location));
}
