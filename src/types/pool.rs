//! A named, FIFO job queue with an attached set of workers, admission
//! control, and per-cycle statistics. Internally this used to be called
//! a "JobList"; every log message and the control-verb vocabulary calls
//! it a pool, so the Rust type picks that name and keeps "joblist" only
//! as prose.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::warn;

use super::job::{Job, JobStatus};
use super::worker::Worker;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolStatus {
    Opened,
    Closed,
}

/// Why `Pool::add` declined a job; both variants are surfaced to the
/// client verbatim.
#[derive(Debug, Clone)]
pub enum AdmitError {
    ClosedOrNoWorkers { pool: String },
    Blocked { pool: String, pending: u64 },
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::ClosedOrNoWorkers { pool } => {
                write!(f, "pool {pool} is currently closed or has no running workers")
            },
            AdmitError::Blocked { pool, pending } => {
                write!(f, "pool {pool} is currently blocked, too many pending jobs ({pending})")
            },
        }
    }
}
impl std::error::Error for AdmitError {}

#[derive(Default, Clone, Copy)]
struct Stats {
    assign_total_ms: u64,
    nb_assign: u64,
    process_total_ms: u64,
    nb_process: u64,
    nb_errors: u64,
}

struct Inner {
    jobs: VecDeque<Arc<Job>>,
    status: PoolStatus,
    stats: Stats,
    startup: Instant,
}

pub struct Pool {
    name: String,
    backend_tag: String,
    max_pending_warn: u64,
    max_pending_block: u64,
    inner: Mutex<Inner>,
    cond: Condvar,
    /// Attached workers. Populated once at startup by the server root and
    /// never mutated afterwards; no lock needed to read it.
    workers: Mutex<Vec<Arc<Worker>>>,
}

impl Pool {
    pub fn new(
        name: impl Into<String>,
        backend_tag: impl Into<String>,
        max_pending_warn: u64,
        max_pending_block: u64,
    ) -> Arc<Pool> {
        Arc::new(Pool {
            name: name.into(),
            backend_tag: backend_tag.into(),
            max_pending_warn,
            max_pending_block,
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                status: PoolStatus::Opened,
                stats: Stats::default(),
                startup: Instant::now(),
            }),
            cond: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_tag(&self) -> &str {
        &self.backend_tag
    }

    pub fn attach_worker(&self, worker: Arc<Worker>) {
        self.workers.lock().unwrap().push(worker);
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.lock().unwrap().clone()
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.lock().unwrap().status
    }

    /// Changing CLOSED -> OPENED resets the statistics block and the
    /// startup timestamp (uptime counts from the most recent open). Any
    /// other transition, including OPENED -> OPENED, is a no-op beyond the
    /// flag itself: calling this twice with the same status never resets
    /// statistics a second time.
    pub fn set_status(&self, status: PoolStatus) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == PoolStatus::Closed && status == PoolStatus::Opened {
            inner.stats = Stats::default();
            inner.startup = Instant::now();
        }
        inner.status = status;
    }

    fn has_running_worker(&self) -> bool {
        self.workers.lock().unwrap().iter().any(|w| w.is_running())
    }

    /// Admits a job, applying admission control in order:
    /// closed-or-no-workers, then block threshold, then warn threshold
    /// (log only). On success the job is appended and exactly one waiter
    /// is woken. The closed/no-workers check and the append happen under
    /// the same held `inner` guard, so a concurrent `shutdown` can't close
    /// the pool in the gap between the check and the push.
    pub fn add(&self, job: Arc<Job>) -> Result<(), AdmitError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.status == PoolStatus::Closed || !self.has_running_worker() {
            return Err(AdmitError::ClosedOrNoWorkers { pool: self.name.clone() });
        }

        if self.max_pending_warn > 0 || self.max_pending_block > 0 {
            let pending = inner.jobs.iter().filter(|j| j.status() == JobStatus::Pending).count() as u64;

            if self.max_pending_block > 0 && pending >= self.max_pending_block {
                return Err(AdmitError::Blocked { pool: self.name.clone(), pending });
            }
            if self.max_pending_warn > 0 && pending >= self.max_pending_warn {
                warn!(pool = %self.name, pending, allowed = self.max_pending_warn, "pending job count high");
            }
        }

        inner.jobs.push_back(job);
        self.cond.notify_one();
        Ok(())
    }

    /// Removes `job` if present, updating statistics: assignation delay is
    /// always recorded; processing time and error count only if the job
    /// reached COMPLETE.
    pub fn remove(&self, job: &Arc<Job>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.jobs.iter().position(|j| j.id() == job.id()) {
            inner.jobs.remove(pos);
        }
        inner.stats.assign_total_ms += job.assignation_delay_ms().max(0) as u64;
        inner.stats.nb_assign += 1;
        if job.status() == JobStatus::Complete {
            inner.stats.process_total_ms += job.processing_time_ms().max(0) as u64;
            inner.stats.nb_process += 1;
            if job.is_error() {
                inner.stats.nb_errors += 1;
            }
        }
    }

    /// Single non-blocking scan for a claimable job: attempts
    /// PENDING->PROCESSING on each job in FIFO order, returning the first
    /// one whose CAS succeeds. Releases the lock regardless of outcome.
    pub fn try_assign(&self) -> Option<Arc<Job>> {
        let inner = self.inner.lock().unwrap();
        Self::scan_and_claim(&inner)
    }

    fn scan_and_claim(inner: &Inner) -> Option<Arc<Job>> {
        for job in inner.jobs.iter() {
            if job.transition(JobStatus::Pending, JobStatus::Processing) {
                return Some(job.clone());
            }
        }
        None
    }

    /// The worker run-loop's idle step: scans for a claimable job and, if
    /// none is found, waits on the pool condvar without ever releasing the
    /// lock in between — this is what prevents the lost-wakeup race
    /// between an `add` signal and a shutdown broadcast landing in the gap
    /// between the scan and the wait. Re-checks both the worker's own
    /// shutdown flag and the scan on every wake. Returns `None` only once
    /// shutdown has been requested for this worker.
    pub fn assign_or_wait(&self, worker: &Worker) -> Option<Arc<Job>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(job) = Self::scan_and_claim(&inner) {
                return Some(job);
            }
            if worker.shutdown_requested() {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Returns a job reserved PROCESSING by a worker whose backend
    /// connection just died back to PENDING and re-admits it. If the
    /// pool won't take it back (e.g. concurrently closed), the job is
    /// marked COMPLETE carrying the admission error instead.
    pub fn giveup(self: &Arc<Self>, job: Arc<Job>) {
        self.remove(&job);
        if !job.transition(JobStatus::Processing, JobStatus::Pending) {
            warn!(pool = %self.name, job = %job.id(), "giveup called on a job not in PROCESSING");
            return;
        }
        if let Err(err) = self.add(job.clone()) {
            job.set_error(err.to_string());
            job.transition(JobStatus::Pending, JobStatus::Complete);
        }
    }

    /// Drops every job currently queued. A job a client is still holding a
    /// reference to survives (Arc keeps it alive) but becomes unschedulable
    /// — it will never again be found by a scan.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.clear();
    }

    /// Builds the Name/Value map returned by `squale_local_stats`,
    /// including a synthetic per-worker breakdown. Key vocabulary is
    /// carried over from `squale_joblist_get_stats` in the original C so
    /// that existing monitoring scripts built against Squale keep working.
    pub fn local_stats(&self) -> Vec<(String, String)> {
        let (pending_jobs, jobs_in_list, nb_process, nb_errors, avg_assign, avg_process, uptime_s) = {
            let inner = self.inner.lock().unwrap();
            let pending = inner.jobs.iter().filter(|j| j.status() == JobStatus::Pending).count();
            let jobs_in_list = inner.jobs.len();
            let avg_assign = if inner.stats.nb_assign > 0 {
                inner.stats.assign_total_ms / inner.stats.nb_assign
            } else {
                0
            };
            let avg_process = if inner.stats.nb_process > 0 {
                inner.stats.process_total_ms / inner.stats.nb_process
            } else {
                0
            };
            let uptime = inner.startup.elapsed().as_secs();
            (
                pending,
                jobs_in_list,
                inner.stats.nb_process,
                inner.stats.nb_errors,
                avg_assign,
                avg_process,
                uptime,
            )
        };

        let workers = self.workers();
        let mut out: Vec<(String, String)> = Vec::new();

        for (idx, worker) in workers.iter().enumerate() {
            let n = idx + 1;
            out.push((format!("worker_{n}_reconnections"), worker.reconnections().to_string()));
            out.push((format!("worker_{n}_errors"), worker.error_count().to_string()));
            out.push((format!("worker_{n}_processed_jobs"), worker.processed_count().to_string()));
            out.push((format!("worker_{n}_status"), worker.status()));
        }

        out.push(("nb_workers".to_string(), workers.len().to_string()));
        out.push(("pending_jobs".to_string(), pending_jobs.to_string()));
        out.push(("jobs_in_list".to_string(), jobs_in_list.to_string()));
        out.push(("processed_jobs".to_string(), nb_process.to_string()));
        out.push(("errors".to_string(), nb_errors.to_string()));
        out.push(("backend".to_string(), self.backend_tag.clone()));
        out.push(("avg_assign_delay (ms)".to_string(), avg_assign.to_string()));
        out.push(("avg_process_time (ms)".to_string(), avg_process.to_string()));
        out.push(("uptime (s)".to_string(), uptime_s.to_string()));

        out
    }

    /// `squale_startup`: if closed, clears any stale jobs, reopens (which
    /// resets statistics), and (re)spawns every attached worker.
    pub fn startup(self: &Arc<Self>) {
        if self.status() != PoolStatus::Closed {
            return;
        }
        self.clear();
        self.set_status(PoolStatus::Opened);
        for worker in self.workers() {
            worker.spawn(Arc::downgrade(self));
        }
    }

    /// `squale_shutdown`: if open, closes admission, asks every attached
    /// worker to stop (each finishes its in-flight job first), and drops
    /// whatever is left in the queue. Does not block waiting for workers to
    /// actually finish — see `Squale`'s global shutdown for that spin.
    pub fn shutdown(&self) {
        if self.status() != PoolStatus::Opened {
            return;
        }
        self.set_status(PoolStatus::Closed);
        self.request_all_workers_shutdown();
        self.clear();
    }

    /// Requests shutdown of every attached worker without touching the
    /// pool's open/closed status — used by the server root's global
    /// shutdown sequence, as distinct from the `squale_shutdown` control
    /// verb which also closes the pool.
    ///
    /// Sets each worker's shutdown flag and broadcasts under the same
    /// `inner` guard `assign_or_wait` holds across its scan-then-wait: that
    /// is what prevents the lost wakeup where a worker reads
    /// `shutdown_requested() == false`, this function sets the flag and
    /// broadcasts into the void, and only then does the worker call
    /// `cond.wait` and block forever.
    pub fn request_all_workers_shutdown(&self) {
        let _inner = self.inner.lock().unwrap();
        for worker in self.workers() {
            worker.request_shutdown();
        }
        self.cond.notify_all();
    }

    pub fn all_workers_shutdown_complete(&self) -> bool {
        self.workers().iter().all(|w| w.shutdown_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::backend::StubBackend;

    #[test]
    fn admission_blocked_reports_pending_count() {
        let pool = Pool::new("p", "stub", 0, 2);
        let w = Worker::new(1, Box::new(StubBackend::new("stub")), 0);
        w.mark_running_for_test();
        pool.attach_worker(w);

        let j1 = Arc::new(Job::new("SELECT 1".into()));
        let j2 = Arc::new(Job::new("SELECT 1".into()));
        let j3 = Arc::new(Job::new("SELECT 1".into()));
        assert!(pool.add(j1).is_ok());
        assert!(pool.add(j2).is_ok());
        match pool.add(j3) {
            Err(AdmitError::Blocked { pending, .. }) => assert_eq!(pending, 2),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn set_status_opened_twice_is_noop_on_stats() {
        let pool = Pool::new("p", "stub", 0, 0);
        pool.set_status(PoolStatus::Closed);
        pool.set_status(PoolStatus::Opened);
        let before = pool.local_stats();
        pool.set_status(PoolStatus::Opened);
        let after = pool.local_stats();
        assert_eq!(
            before.iter().find(|(k, _)| k == "processed_jobs"),
            after.iter().find(|(k, _)| k == "processed_jobs"),
        );
    }

    #[test]
    fn clear_is_idempotent() {
        let pool = Pool::new("p", "stub", 0, 0);
        pool.clear();
        pool.clear();
    }

    /// Regression test for the lost-wakeup fix: `request_all_workers_shutdown`
    /// must serialize against `assign_or_wait`'s scan-then-wait via the same
    /// `inner` mutex, so a worker already parked in `cond.wait` is always
    /// woken rather than missing a broadcast that landed before it waited.
    #[test]
    fn request_all_workers_shutdown_wakes_a_waiting_worker() {
        let pool = Pool::new("p", "stub", 0, 0);
        let worker = Worker::new(1, Box::new(StubBackend::new("stub")), 0);
        worker.mark_running_for_test();
        pool.attach_worker(worker.clone());

        let waiter_pool = pool.clone();
        let waiter_worker = worker.clone();
        let handle = std::thread::spawn(move || waiter_pool.assign_or_wait(&waiter_worker));

        // Give the spawned thread a chance to actually block inside
        // `cond.wait` before the shutdown broadcast fires.
        std::thread::sleep(std::time::Duration::from_millis(50));
        pool.request_all_workers_shutdown();

        let result = handle.join().unwrap();
        assert!(result.is_none(), "expected the waiter to wake with no job, got {result:?}");
    }
}
