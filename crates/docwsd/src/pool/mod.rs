//! Worker pool: process table, ready workers and the supervision machinery.
//!
//! The pool tracks every process the top-level server launched and keeps a
//! set of registered, unclaimed workers that client sessions can pair with.
//! [`supervisor::Supervisor`] keeps the pool at its pre-spawn target.

pub mod error;
pub mod jail;
pub mod lock;
pub mod privilege;
pub mod supervisor;

pub use error::{JailError, LockError, PrivilegeError, SpawnError};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Notify;

use crate::session::Outbox;

/// What a tracked process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// A render worker that registers over the control channel.
    Worker,
    /// The long-lived container process hosting the file-transfer helper.
    Container,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => f.write_str("worker"),
            Self::Container => f.write_str("container"),
        }
    }
}

/// Lifecycle of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Launched, not yet registered.
    Pending,
    /// Registered (workers) or running (container).
    Active,
    /// Exit observed.
    Dead,
}

/// One row of the process table.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub role: ProcessRole,
    /// Worker id passed on the command line; `None` for the container.
    pub worker_id: Option<u64>,
    pub spawned_at: DateTime<Utc>,
    pub state: ProcessState,
    /// Exit code once the process has exited normally.
    pub exit_code: Option<i32>,
}

/// A registered worker's control connection.
///
/// Cloned between the worker's session, the pool and whichever client
/// session claims it.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    worker_id: u64,
    outbox: Outbox,
    client: Arc<Mutex<Option<Outbox>>>,
}

impl WorkerLink {
    pub fn new(worker_id: u64, outbox: Outbox) -> Self {
        Self {
            worker_id,
            outbox,
            client: Arc::new(Mutex::new(None)),
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Sending half of the worker's connection.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Pair a client. Returns `false` if another client already holds it.
    pub fn attach_client(&self, client: Outbox) -> bool {
        let mut slot = lock(&self.client);
        if slot.is_some() {
            return false;
        }
        *slot = Some(client);
        true
    }

    /// The paired client's outbox, if any.
    pub fn client(&self) -> Option<Outbox> {
        lock(&self.client).clone()
    }

    /// Forget the paired client and return it.
    pub fn detach_client(&self) -> Option<Outbox> {
        lock(&self.client).take()
    }
}

/// How many reaped records [`WorkerPool::recent_exits`] keeps.
const RECENT_EXITS: usize = 32;

#[derive(Debug, Default)]
struct PoolState {
    table: HashMap<u32, ProcessRecord>,
    available: VecDeque<WorkerLink>,
    /// Newest last. Outlives [`WorkerPool::purge_dead`].
    exits: VecDeque<ProcessRecord>,
    workers_launched: usize,
    registrations: usize,
}

/// Process table plus the queue of unclaimed workers.
#[derive(Debug)]
pub struct WorkerPool {
    prespawn: usize,
    state: Mutex<PoolState>,
    worker_ready: Notify,
    capacity: Notify,
}

impl WorkerPool {
    pub fn new(prespawn: usize) -> Self {
        Self {
            prespawn,
            state: Mutex::new(PoolState::default()),
            worker_ready: Notify::new(),
            capacity: Notify::new(),
        }
    }

    /// Target number of unclaimed plus starting workers.
    pub fn prespawn(&self) -> usize {
        self.prespawn
    }

    /// Track a freshly launched process.
    pub fn record_spawn(&self, pid: u32, role: ProcessRole, worker_id: Option<u64>) {
        let state = match role {
            ProcessRole::Worker => ProcessState::Pending,
            ProcessRole::Container => ProcessState::Active,
        };
        let record = ProcessRecord {
            pid,
            role,
            worker_id,
            spawned_at: Utc::now(),
            state,
            exit_code: None,
        };
        let mut state = self.lock();
        if role == ProcessRole::Worker {
            state.workers_launched += 1;
        }
        state.table.insert(pid, record);
    }

    /// Mark a process as exited without a known exit code.
    pub fn mark_dead(&self, pid: u32) -> Option<ProcessRecord> {
        self.mark_exited(pid, None)
    }

    /// Mark a process as exited.
    ///
    /// Returns the record as it was before the transition, or `None` for a pid
    /// the pool never launched. A worker still waiting in the available queue
    /// is withdrawn.
    pub fn mark_exited(&self, pid: u32, exit_code: Option<i32>) -> Option<ProcessRecord> {
        let previous = {
            let mut state = self.lock();
            let record = state.table.get_mut(&pid)?;
            let previous = record.clone();
            record.state = ProcessState::Dead;
            record.exit_code = exit_code;
            let reaped = record.clone();
            if let Some(worker_id) = previous.worker_id {
                state.available.retain(|link| link.worker_id != worker_id);
            }
            if state.exits.len() == RECENT_EXITS {
                state.exits.pop_front();
            }
            state.exits.push_back(reaped);
            previous
        };
        self.capacity.notify_one();
        Some(previous)
    }

    /// Drop every dead record. Returns how many were removed.
    pub fn purge_dead(&self) -> usize {
        let mut state = self.lock();
        let before = state.table.len();
        state
            .table
            .retain(|_, record| record.state != ProcessState::Dead);
        before - state.table.len()
    }

    /// Accept a worker's control connection after its greeting.
    ///
    /// The matching record becomes active and the worker joins the available
    /// queue. Workers the pool did not launch (a stale process from an earlier
    /// run, say) are still accepted but logged.
    pub fn register_worker(&self, link: WorkerLink) {
        let worker_id = link.worker_id;
        {
            let mut state = self.lock();
            let record = state
                .table
                .values_mut()
                .find(|record| record.worker_id == Some(worker_id));
            match record {
                Some(record) if record.state == ProcessState::Dead => {
                    warn!(
                        "Worker {} registered after its process {} was reaped",
                        worker_id, record.pid
                    );
                }
                Some(record) => {
                    record.state = ProcessState::Active;
                    info!("Worker {} (pid {}) registered", worker_id, record.pid);
                }
                None => warn!("Unknown worker {} registered", worker_id),
            }
            state.registrations += 1;
            state.available.push_back(link);
        }
        self.worker_ready.notify_one();
        self.capacity.notify_one();
    }

    /// Withdraw a worker whose control connection went away.
    pub fn unregister_worker(&self, worker_id: u64) {
        let removed = {
            let mut state = self.lock();
            let before = state.available.len();
            state.available.retain(|link| link.worker_id != worker_id);
            before - state.available.len()
        };
        debug!(
            "Worker {} disconnected ({} unclaimed entries withdrawn)",
            worker_id, removed
        );
        self.capacity.notify_one();
    }

    /// Take an unclaimed worker, waiting up to `timeout` for one to register.
    pub async fn claim_worker(&self, timeout: Duration) -> Option<WorkerLink> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ready = self.worker_ready.notified();
            if let Some(link) = self.pop_available() {
                self.capacity.notify_one();
                return Some(link);
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return None;
            }
        }
    }

    fn pop_available(&self) -> Option<WorkerLink> {
        let mut state = self.lock();
        while let Some(link) = state.available.pop_front() {
            if link.outbox.is_closed() {
                continue;
            }
            return Some(link);
        }
        None
    }

    /// Resolves the next time claimable or pending capacity changes.
    pub async fn capacity_changed(&self) {
        self.capacity.notified().await;
    }

    /// Registered workers nobody has claimed yet.
    pub fn available_count(&self) -> usize {
        self.lock().available.len()
    }

    /// Workers launched but not yet registered.
    pub fn pending_count(&self) -> usize {
        self.count_where(|r| r.state == ProcessState::Pending)
    }

    /// Registered workers, claimed or not.
    pub fn active_count(&self) -> usize {
        self.count_where(|r| r.role == ProcessRole::Worker && r.state == ProcessState::Active)
    }

    /// Processes whose exit has not been observed.
    pub fn live_count(&self) -> usize {
        self.count_where(|r| r.state != ProcessState::Dead)
    }

    /// Pids of processes whose exit has not been observed.
    pub fn live_pids(&self) -> Vec<u32> {
        self.lock()
            .table
            .values()
            .filter(|r| r.state != ProcessState::Dead)
            .map(|r| r.pid)
            .collect()
    }

    /// Live record for a role, if any.
    pub fn live_role(&self, role: ProcessRole) -> Option<ProcessRecord> {
        self.lock()
            .table
            .values()
            .find(|r| r.role == role && r.state != ProcessState::Dead)
            .cloned()
    }

    /// Snapshot of the process table, oldest first.
    pub fn records(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<_> = self.lock().table.values().cloned().collect();
        records.sort_by_key(|r| (r.spawned_at, r.pid));
        records
    }

    /// The most recently reaped processes, oldest first.
    pub fn recent_exits(&self) -> Vec<ProcessRecord> {
        self.lock().exits.iter().cloned().collect()
    }

    /// Workers launched since the pool was created.
    pub fn workers_launched(&self) -> usize {
        self.lock().workers_launched
    }

    /// Control connections registered since the pool was created.
    pub fn registrations(&self) -> usize {
        self.lock().registrations
    }

    /// How many workers must be launched to get back to the target.
    pub fn deficit(&self) -> usize {
        let covered = self.available_count() + self.pending_count();
        self.prespawn.saturating_sub(covered)
    }

    fn count_where(&self, predicate: impl Fn(&ProcessRecord) -> bool) -> usize {
        self.lock().table.values().filter(|r| predicate(r)).count()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
