//! Process supervision: launch workers, reap them, keep the pool topped up.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::error::SpawnError;
use super::jail::{JailSpec, new_jail_id};
use super::privilege::DebugIdentity;
use super::{ProcessRecord, ProcessRole, ProcessState, WorkerPool};

/// A container that exits sooner than this counts as a failed start.
const EARLY_EXIT: Duration = Duration::from_secs(5);

/// Upper bound for the delay between failed starts.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// How to start child processes of this binary.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable to run, normally the server's own binary.
    pub program: PathBuf,
    /// Port the worker listener actually bound.
    pub worker_port: u16,
    pub transfer_port: u16,
    pub lock_file: PathBuf,
    /// `None` runs workers without a jail.
    pub jail: Option<JailSpec>,
    pub debug: DebugIdentity,
    /// Passed to children as `RUST_LOG`.
    pub log_filter: Option<String>,
}

impl LaunchSpec {
    /// Command-line arguments for a worker with the given id.
    pub fn worker_args(&self, worker_id: u64) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--worker-id".to_string(),
            worker_id.to_string(),
            "--worker-port".to_string(),
            self.worker_port.to_string(),
            "--lock-file".to_string(),
            self.lock_file.display().to_string(),
        ];

        match &self.jail {
            Some(jail) => {
                args.push("--child-root".to_string());
                args.push(jail.child_root.display().to_string());
                args.push("--sys-template".to_string());
                args.push(jail.sys_template.display().to_string());
                args.push("--app-template".to_string());
                args.push(jail.app_template.display().to_string());
                args.push("--app-subpath".to_string());
                args.push(jail.app_subpath.display().to_string());
            }
            None => args.push("--no-jail".to_string()),
        }

        if self.debug.simulate_non_root {
            args.push("--simulate-non-root".to_string());
        }
        if let Some(uid) = self.debug.uid {
            args.push("--debug-uid".to_string());
            args.push(uid.to_string());
        }

        args
    }

    /// Command-line arguments for the container process.
    pub fn container_args(&self) -> Vec<String> {
        vec![
            "container".to_string(),
            "--transfer-port".to_string(),
            self.transfer_port.to_string(),
        ]
    }
}

/// Exit notification from a per-child waiter task.
#[derive(Debug)]
struct ProcessExit {
    pid: u32,
    status: io::Result<ExitStatus>,
}

/// Why the supervision loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Shutdown,
    /// Every tracked process is gone and none could be launched.
    Exhausted,
}

/// Launches children and reacts to their exits.
///
/// Processes that die while starting up (a worker before it registers, the
/// container within [`EARLY_EXIT`]) push the next launch back, doubling the
/// delay each time up to [`MAX_RESTART_DELAY`]. A worker registering clears
/// the streak.
#[derive(Debug)]
pub struct Supervisor {
    pool: Arc<WorkerPool>,
    launch: LaunchSpec,
    backoff: Duration,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
    exits_rx: mpsc::UnboundedReceiver<ProcessExit>,
    failed_starts: u32,
    registrations_seen: usize,
    resume_at: Option<Instant>,
}

impl Supervisor {
    pub fn new(pool: Arc<WorkerPool>, launch: LaunchSpec, backoff: Duration) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            launch,
            backoff,
            exits_tx,
            exits_rx,
            failed_starts: 0,
            registrations_seen: 0,
            resume_at: None,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Launch one worker. Returns its pid.
    pub fn spawn_worker(&self) -> Result<u32, SpawnError> {
        let worker_id = new_jail_id();
        let child = self.command(self.launch.worker_args(worker_id))
            .spawn()
            .map_err(|source| SpawnError::Launch {
                role: "worker",
                program: self.launch.program.clone(),
                source,
            })?;
        let pid = child.id().ok_or(SpawnError::NoPid("worker"))?;
        self.pool
            .record_spawn(pid, ProcessRole::Worker, Some(worker_id));
        self.watch(pid, child);
        info!("Launched worker {} with id {}", pid, worker_id);
        Ok(pid)
    }

    /// Launch the container process. Returns its pid.
    pub fn spawn_container(&self) -> Result<u32, SpawnError> {
        let child = self.command(self.launch.container_args())
            .spawn()
            .map_err(|source| SpawnError::Launch {
                role: "container",
                program: self.launch.program.clone(),
                source,
            })?;
        let pid = child.id().ok_or(SpawnError::NoPid("container"))?;
        self.pool.record_spawn(pid, ProcessRole::Container, None);
        self.watch(pid, child);
        info!("Launched container process {}", pid);
        Ok(pid)
    }

    /// Launch the initial workers. Failures are logged; the run loop retries.
    pub fn prespawn(&self) -> usize {
        let mut launched = 0;
        for _ in 0..self.pool.prespawn() {
            match self.spawn_worker() {
                Ok(_) => launched += 1,
                Err(e) => {
                    error!("Failed to pre-spawn worker: {}", e);
                    break;
                }
            }
        }
        launched
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut cmd = Command::new(&self.launch.program);
        cmd.args(args).stdin(Stdio::null());
        if let Some(filter) = &self.launch.log_filter {
            cmd.env("RUST_LOG", filter);
        }
        cmd
    }

    fn watch(&self, pid: u32, mut child: Child) {
        let exits = self.exits_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exits.send(ProcessExit { pid, status });
        });
    }

    /// Supervise until `shutdown` resolves, then terminate every live child.
    pub async fn run<F>(mut self, shutdown: F) -> SupervisorExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let exit = loop {
            self.replenish().await;
            if self.pool.live_count() == 0 && self.resume_at.is_none() {
                error!("No live processes left and none could be launched");
                break SupervisorExit::Exhausted;
            }

            let resume_at = self.resume_at;
            let exited = tokio::select! {
                _ = &mut shutdown => {
                    info!("Supervisor shutting down");
                    break SupervisorExit::Shutdown;
                }
                Some(exit) = self.exits_rx.recv() => Some(exit),
                _ = self.pool.capacity_changed() => None,
                _ = restart_due(resume_at) => None,
            };
            if let Some(exit) = exited {
                self.handle_exit(exit);
            }
        };

        self.terminate_all().await;
        exit
    }

    fn handle_exit(&mut self, exit: ProcessExit) {
        let ProcessExit { pid, status } = exit;
        let code = status.as_ref().ok().and_then(|status| status.code());
        let record = self.pool.mark_exited(pid, code);
        match (&status, &record) {
            (Ok(status), Some(record)) => info!(
                "{} process {} {}",
                record.role,
                pid,
                format_exit_status(*status)
            ),
            (Ok(status), None) => {
                debug!("Untracked child {} {}", pid, format_exit_status(*status))
            }
            (Err(e), _) if e.raw_os_error() == Some(libc::ECHILD) => warn!(
                "No child process {} even though we think there should be one",
                pid
            ),
            (Err(e), _) => warn!("Error waiting for process {}: {}", pid, e),
        }

        if let Some(record) = record
            && died_starting(&record)
        {
            self.failed_starts = self.failed_starts.saturating_add(1);
            let delay = self.restart_delay();
            warn!(
                "{} process {} died during startup ({} in a row), next launch in {:?}",
                record.role, pid, self.failed_starts, delay
            );
            self.resume_at = Some(Instant::now() + delay);
        }
    }

    /// `backoff` doubled for every failed start after the first.
    fn restart_delay(&self) -> Duration {
        let doublings = self.failed_starts.saturating_sub(1).min(16);
        self.backoff
            .saturating_mul(1 << doublings)
            .min(MAX_RESTART_DELAY)
    }

    /// Relaunch the container if it died, then launch workers until
    /// available plus pending reaches the target.
    ///
    /// Does nothing while a restart delay is pending.
    async fn replenish(&mut self) {
        let registrations = self.pool.registrations();
        if registrations != self.registrations_seen {
            self.registrations_seen = registrations;
            if self.failed_starts > 0 {
                info!("Worker registered, resetting restart delay");
            }
            self.failed_starts = 0;
        }

        if let Some(at) = self.resume_at {
            if Instant::now() < at {
                return;
            }
            self.resume_at = None;
        }

        if self.pool.live_role(ProcessRole::Container).is_none()
            && let Err(e) = self.spawn_container()
        {
            error!("Failed to launch container process: {}", e);
            tokio::time::sleep(self.backoff).await;
        }

        if self.pool.available_count() == 0 && self.pool.pending_count() == 0 {
            let purged = self.pool.purge_dead();
            if purged > 0 {
                debug!("Purged {} dead process records", purged);
            }
        }

        let deficit = self.pool.deficit();
        if deficit > 0 {
            debug!("Worker pool is {} short, launching", deficit);
        }
        for _ in 0..deficit {
            if let Err(e) = self.spawn_worker() {
                error!("Failed to launch worker: {}", e);
                tokio::time::sleep(self.backoff).await;
                break;
            }
        }
    }

    /// Ask every live child to terminate and wait briefly for the exits.
    async fn terminate_all(&mut self) {
        let pids = self.pool.live_pids();
        for pid in &pids {
            info!("Requesting process {} to terminate", pid);
            request_termination(*pid);
        }

        let grace = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(grace);
        while self.pool.live_count() > 0 {
            tokio::select! {
                _ = &mut grace => {
                    warn!("{} processes still running after shutdown", self.pool.live_count());
                    break;
                }
                Some(exit) = self.exits_rx.recv() => {
                    self.pool.mark_dead(exit.pid);
                }
            }
        }
    }
}

fn died_starting(record: &ProcessRecord) -> bool {
    match record.role {
        ProcessRole::Worker => record.state == ProcessState::Pending,
        ProcessRole::Container => (Utc::now() - record.spawned_at)
            .to_std()
            .map_or(true, |age| age < EARLY_EXIT),
    }
}

async fn restart_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Send SIGTERM to `pid`.
pub fn request_termination(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        debug!(
            "kill({}, SIGTERM) failed: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

/// Human-readable exit status.
pub fn format_exit_status(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => {
            let sig_name = match sig {
                libc::SIGKILL => "SIGKILL",
                libc::SIGTERM => "SIGTERM",
                libc::SIGSEGV => "SIGSEGV",
                libc::SIGABRT => "SIGABRT",
                _ => "",
            };
            if sig_name.is_empty() {
                format!("killed by signal {}", sig)
            } else {
                format!("killed by {} (signal {})", sig_name, sig)
            }
        }
        (None, None) => "exited (unknown status)".to_string(),
    }
}
