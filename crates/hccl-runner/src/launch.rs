//! Runs assembled commands and applies the all-or-nothing policy.
//!
//! Local mode keeps a bounded pool of worker processes. Each worker is waited
//! on by its own thread which reports into a single channel, so completions are
//! consumed in the order they happen. The first failure stops the run: every
//! worker still alive gets `SIGTERM` on its own process group and the
//! coordinator returns without waiting for them. The orchestrator process
//! itself is never signalled.
//!
//! There is no timeout. A worker that never exits keeps the run open.

use crate::collab::{BuildAction, BuildSystem};
use crate::command::LaunchCommand;
use crate::config::LaunchMode;
use crate::error::{LaunchError, Result};
use crate::report::Reporter;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::mpsc;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Exited { code: i32 },
    Signaled { signal: i32 },
    SpawnFailed { message: String },
    /// Still running when a sibling failed; a termination signal was sent.
    Aborted,
    /// Never started because the run had already failed.
    NotStarted,
}

impl WorkerStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerStatus::Success)
    }

    fn from_wait(result: io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => WorkerStatus::Success,
            Ok(status) => match status.code() {
                Some(code) => WorkerStatus::Exited { code },
                None => WorkerStatus::Signaled {
                    signal: exit_signal(&status).unwrap_or(-1),
                },
            },
            Err(e) => WorkerStatus::SpawnFailed {
                message: format!("wait failed: {}", e),
            },
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerOutcome {
    pub rank: Option<u32>,
    pub command: String,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub mode: LaunchMode,
    pub state: RunState,
    pub success: bool,
    pub workers: Vec<WorkerOutcome>,
    pub started_at: String,
    pub finished_at: String,
}

impl RunResult {
    pub fn commands(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.command.clone()).collect()
    }

    pub fn failed_worker(&self) -> Option<&WorkerOutcome> {
        self.workers.iter().find(|w| {
            !matches!(
                w.status,
                WorkerStatus::Success | WorkerStatus::Aborted | WorkerStatus::NotStarted
            )
        })
    }

    /// Turns a failed run into the fatal error reported to the user.
    pub fn into_result(self) -> Result<RunResult> {
        if self.success {
            return Ok(self);
        }
        let (stage, what) = match self.mode {
            LaunchMode::Local => ("run_test", "one of the hccl_demo processes failed"),
            LaunchMode::Mpi => ("run_mpi_test", "the MPI launched hccl_demo run failed"),
        };
        let detail = match self.failed_worker() {
            Some(w) => format!(
                "{} (rank {}: {:?})",
                what,
                w.rank.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
                w.status
            ),
            None => what.to_string(),
        };
        Err(LaunchError::WorkerFailure {
            stage,
            message: detail,
            commands: self.commands(),
        })
    }
}

pub struct LaunchCoordinator<'a> {
    reporter: &'a dyn Reporter,
    working_dir: Option<PathBuf>,
    state: RunState,
}

impl<'a> LaunchCoordinator<'a> {
    pub fn new(reporter: &'a dyn Reporter) -> Self {
        Self {
            reporter,
            working_dir: None,
            state: RunState::Idle,
        }
    }

    /// Directory every launched process starts in.
    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn begin(&mut self) -> Result<()> {
        if self.state != RunState::Idle {
            return Err(LaunchError::config(
                "launch",
                format!("coordinator already used, state is {:?}", self.state),
            ));
        }
        self.state = RunState::Running;
        Ok(())
    }

    fn finish(&mut self, success: bool) -> RunState {
        self.state = if success {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        self.state
    }

    /// Builds the executable if it is missing. Runs before anything is launched,
    /// so a failed build leaves the coordinator idle.
    pub fn ensure_executable(
        &self,
        executable: &Path,
        build: &dyn BuildSystem,
        action: BuildAction,
        prefix: Option<&LaunchCommand>,
    ) -> Result<()> {
        if executable.exists() {
            return Ok(());
        }
        self.reporter.info(
            "make_demo",
            &format!("{} not found, building it ({:?})", executable.display(), action),
        );
        let command_line = build.command_line(action, prefix);
        let code = build.build(action, prefix).map_err(|e| {
            LaunchError::dependency(
                "make_demo",
                format!("the following build command has failed: {}: {:#}", command_line, e),
            )
        })?;
        if code != 0 {
            return Err(LaunchError::dependency(
                "make_demo",
                format!(
                    "the following build command has failed with code {}: {}",
                    code, command_line
                ),
            ));
        }
        if !executable.exists() {
            return Err(LaunchError::dependency(
                "make_demo",
                format!("build succeeded but {} is still missing", executable.display()),
            ));
        }
        Ok(())
    }

    /// Launches every job with at most `pool_size` alive at once.
    pub fn run_local(&mut self, jobs: Vec<(u32, LaunchCommand)>, pool_size: usize) -> Result<RunResult> {
        self.begin()?;
        let started_at = Utc::now().to_rfc3339();
        let pool_size = pool_size.max(1);
        let rendered: Vec<String> = jobs.iter().map(|(_, c)| c.render()).collect();
        self.reporter
            .info("run_test", &format!("hccl_demo command lines:\n{}", rendered.join("\n")));

        let (tx, rx) = mpsc::channel::<(usize, io::Result<ExitStatus>)>();
        let mut statuses: Vec<Option<WorkerStatus>> = vec![None; jobs.len()];
        let mut pending: VecDeque<usize> = (0..jobs.len()).collect();
        let mut running: BTreeMap<usize, u32> = BTreeMap::new();
        let mut failed = false;

        loop {
            while !failed && running.len() < pool_size {
                let Some(index) = pending.pop_front() else {
                    break;
                };
                match spawn_worker(index, &jobs[index].1, self.working_dir.as_deref(), tx.clone()) {
                    Ok(pid) => {
                        self.reporter
                            .debug("run_process", &format!("started pid {}: {}", pid, rendered[index]));
                        running.insert(index, pid);
                    }
                    Err(e) => {
                        self.reporter.error(
                            "run_process",
                            &format!("failed to start {}: {}", rendered[index], e),
                        );
                        statuses[index] = Some(WorkerStatus::SpawnFailed {
                            message: e.to_string(),
                        });
                        failed = true;
                    }
                }
            }
            if failed || running.is_empty() {
                break;
            }

            let (index, wait) = match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            running.remove(&index);
            let status = WorkerStatus::from_wait(wait);
            self.reporter.debug(
                "run_test",
                &format!("rank {} finished: {:?}", jobs[index].0, status),
            );
            if !status.is_success() {
                failed = true;
            }
            statuses[index] = Some(status);
        }

        if failed {
            self.reporter.error(
                "run_test",
                "one of the hccl_demo processes failed, terminating hccl demo",
            );
            // A reaped worker's group may already be gone and its id reused.
            collect_finished(&rx, &mut running, &mut statuses);
            for (&index, &pid) in &running {
                terminate_group(pid, self.reporter);
                statuses[index] = Some(WorkerStatus::Aborted);
            }
        }

        let workers = jobs
            .into_iter()
            .zip(rendered)
            .zip(statuses)
            .map(|(((rank, _), command), status)| WorkerOutcome {
                rank: Some(rank),
                command,
                status: status.unwrap_or(WorkerStatus::NotStarted),
            })
            .collect::<Vec<_>>();
        let success = !failed && workers.iter().all(|w| w.status.is_success());
        let state = self.finish(success);
        Ok(RunResult {
            mode: LaunchMode::Local,
            state,
            success,
            workers,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        })
    }

    /// Runs the single MPI launcher process and blocks until it exits.
    pub fn run_mpi(&mut self, command: LaunchCommand) -> Result<RunResult> {
        self.begin()?;
        let started_at = Utc::now().to_rfc3339();
        let rendered = command.render();
        self.reporter
            .info("run_mpi_test", &format!("hccl_demo mpi command line: {}", rendered));

        let mut process = command.to_process();
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        let status = match process.status() {
            Ok(status) => WorkerStatus::from_wait(Ok(status)),
            Err(e) => WorkerStatus::SpawnFailed {
                message: e.to_string(),
            },
        };
        let success = status.is_success();
        if !success {
            self.reporter
                .error("run_mpi_test", &format!("mpi run failed: {:?}", status));
        }
        let state = self.finish(success);
        Ok(RunResult {
            mode: LaunchMode::Mpi,
            state,
            success,
            workers: vec![WorkerOutcome {
                rank: None,
                command: rendered,
                status,
            }],
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        })
    }
}

fn spawn_worker(
    index: usize,
    command: &LaunchCommand,
    working_dir: Option<&Path>,
    tx: mpsc::Sender<(usize, io::Result<ExitStatus>)>,
) -> io::Result<u32> {
    let mut process = command.to_process();
    if let Some(dir) = working_dir {
        process.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        process.process_group(0);
    }
    let mut child = process.spawn()?;
    let pid = child.id();
    thread::spawn(move || {
        let result = child.wait();
        let _ = tx.send((index, result));
    });
    Ok(pid)
}

/// Records completions already queued on `rx` and drops those workers from
/// `running`, so only processes that have not been reaped get signalled.
fn collect_finished(
    rx: &mpsc::Receiver<(usize, io::Result<ExitStatus>)>,
    running: &mut BTreeMap<usize, u32>,
    statuses: &mut [Option<WorkerStatus>],
) {
    while let Ok((index, wait)) = rx.try_recv() {
        if running.remove(&index).is_some() {
            statuses[index] = Some(WorkerStatus::from_wait(wait));
        }
    }
}

#[cfg(unix)]
fn terminate_group(pid: u32, reporter: &dyn Reporter) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the worker's own process group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc != 0 {
        reporter.debug(
            "run_test",
            &format!("process group {} already gone: {}", pgid, io::Error::last_os_error()),
        );
    } else {
        reporter.debug("run_test", &format!("sent SIGTERM to process group {}", pgid));
    }
}

#[cfg(not(unix))]
fn terminate_group(pid: u32, reporter: &dyn Reporter) {
    reporter.warn(
        "run_test",
        &format!("cannot signal worker {} on this platform", pid),
    );
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::report::MemoryReporter;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn queued_completions_are_recorded_before_signalling() {
        use std::os::unix::process::ExitStatusExt;
        let (tx, rx) = mpsc::channel();
        tx.send((1, Ok(ExitStatus::from_raw(0)))).expect("send");
        tx.send((2, Ok(ExitStatus::from_raw(2 << 8)))).expect("send");
        let mut running: BTreeMap<usize, u32> = [(0, 100), (1, 101), (2, 102)].into_iter().collect();
        let mut statuses: Vec<Option<WorkerStatus>> = vec![None; 3];

        collect_finished(&rx, &mut running, &mut statuses);

        assert_eq!(running.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(statuses[0], None);
        assert_eq!(statuses[1], Some(WorkerStatus::Success));
        assert_eq!(statuses[2], Some(WorkerStatus::Exited { code: 2 }));
    }

    #[test]
    fn all_zero_exits_succeed() {
        let r = MemoryReporter::new();
        let mut coordinator = LaunchCoordinator::new(&r);
        assert_eq!(coordinator.state(), RunState::Idle);
        let jobs = (0..4).map(|rank| (rank, sh("exit 0"))).collect();
        let result = coordinator.run_local(jobs, 4).expect("run");
        assert!(result.success);
        assert_eq!(result.state, RunState::Succeeded);
        assert_eq!(coordinator.state(), RunState::Succeeded);
        assert_eq!(result.workers.len(), 4);
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn one_failure_aborts_running_siblings() {
        let r = MemoryReporter::new();
        let mut coordinator = LaunchCoordinator::new(&r);
        let jobs = vec![
            (0, sh("sleep 30")),
            (1, sh("exit 3")),
            (2, sh("sleep 30")),
        ];
        let started = Instant::now();
        let result = coordinator.run_local(jobs, 3).expect("run");
        assert!(started.elapsed() < Duration::from_secs(20), "coordinator waited for siblings");
        assert!(!result.success);
        assert_eq!(result.state, RunState::Failed);
        assert_eq!(result.workers[1].status, WorkerStatus::Exited { code: 3 });
        assert_eq!(result.workers[0].status, WorkerStatus::Aborted);
        assert_eq!(result.workers[2].status, WorkerStatus::Aborted);
        assert!(r
            .events()
            .iter()
            .any(|(_, _, m)| m.starts_with("sent SIGTERM to process group")));

        let err = result.into_result().expect_err("failed run");
        assert_eq!(err.exit_code(), 4);
        assert_eq!(err.commands().len(), 3);
        assert!(err.to_string().contains("exit 3"));
    }

    #[test]
    fn pool_bound_leaves_queued_jobs_unstarted_after_failure() {
        let r = MemoryReporter::new();
        let mut coordinator = LaunchCoordinator::new(&r);
        let jobs = vec![(0, sh("exit 1")), (1, sh("exit 0")), (2, sh("exit 0"))];
        let result = coordinator.run_local(jobs, 1).expect("run");
        assert_eq!(result.workers[0].status, WorkerStatus::Exited { code: 1 });
        assert_eq!(result.workers[1].status, WorkerStatus::NotStarted);
        assert_eq!(result.workers[2].status, WorkerStatus::NotStarted);
    }

    #[test]
    fn spawn_failure_counts_as_worker_failure() {
        let r = MemoryReporter::new();
        let mut coordinator = LaunchCoordinator::new(&r);
        let jobs = vec![(0, LaunchCommand::new("/nonexistent/hccl_demo"))];
        let result = coordinator.run_local(jobs, 1).expect("run");
        assert!(matches!(result.workers[0].status, WorkerStatus::SpawnFailed { .. }));
        assert_eq!(result.state, RunState::Failed);
    }

    #[test]
    fn coordinator_is_single_use() {
        let r = MemoryReporter::new();
        let mut coordinator = LaunchCoordinator::new(&r);
        coordinator.run_local(vec![(0, sh("exit 0"))], 1).expect("first run");
        assert!(coordinator.run_local(vec![(0, sh("exit 0"))], 1).is_err());
    }

    #[test]
    fn mpi_exit_code_maps_to_state() {
        let r = MemoryReporter::new();
        let mut ok = LaunchCoordinator::new(&r);
        assert!(ok.run_mpi(sh("exit 0")).expect("run").success);
        let mut bad = LaunchCoordinator::new(&r);
        let result = bad.run_mpi(sh("exit 7")).expect("run");
        assert_eq!(result.state, RunState::Failed);
        assert_eq!(result.workers[0].status, WorkerStatus::Exited { code: 7 });
        assert_eq!(result.into_result().expect_err("failed").stage(), "run_mpi_test");
    }

    #[test]
    fn hung_worker_blocks_the_run() {
        // Known gap: there is no timeout, the run stays open until the worker exits.
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let r = MemoryReporter::new();
            let mut coordinator = LaunchCoordinator::new(&r);
            let result = coordinator
                .run_local(vec![(0, sh("exit 0")), (1, sh("sleep 2"))], 2)
                .expect("run");
            let _ = done_tx.send(());
            result
        });
        assert!(
            done_rx.recv_timeout(Duration::from_millis(500)).is_err(),
            "run finished while a worker was still running"
        );
        let result = handle.join().expect("join");
        assert!(result.success);
    }

    #[test]
    fn signaled_worker_is_a_failure() {
        let r = MemoryReporter::new();
        let mut coordinator = LaunchCoordinator::new(&r);
        let result = coordinator
            .run_local(vec![(0, sh("kill -KILL $$"))], 1)
            .expect("run");
        assert_eq!(
            result.workers[0].status,
            WorkerStatus::Signaled {
                signal: libc::SIGKILL
            }
        );
        assert!(!result.success);
    }
}
