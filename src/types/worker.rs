//! A single backend connection driven by a dedicated OS thread. Workers
//! block on I/O against their backend and against the pool's condition
//! variable, so they are plain `std::thread`s rather than Tokio tasks:
//! genuinely blocking calls belong on OS threads, and forcing them
//! through `spawn_blocking` would buy nothing here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, warn};

use super::backend::{Backend, Execution};
use super::job::JobStatus;
use super::pool::Pool;

/// How long a worker sleeps between failed connect attempts: retries
/// every second until success or shutdown.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct Worker {
    index: usize,
    backend: Mutex<Box<dyn Backend>>,
    /// Reconnect every N processed jobs, 0 disables the cycle (grounded on
    /// `cycle_after`/`cycle_counter` in `squaleworker.h`).
    cycle_after: u64,
    cycle_counter: AtomicU64,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown_complete: AtomicBool,
    nb_jobs_processed: AtomicU64,
    nb_errors: AtomicU64,
    nb_db_conn_cycles: AtomicU64,
    status: Mutex<String>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(index: usize, backend: Box<dyn Backend>, cycle_after: u64) -> Arc<Worker> {
        Arc::new(Worker {
            index,
            backend: Mutex::new(backend),
            cycle_after,
            cycle_counter: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            shutdown_complete: AtomicBool::new(false),
            nb_jobs_processed: AtomicU64::new(0),
            nb_errors: AtomicU64::new(0),
            nb_db_conn_cycles: AtomicU64::new(0),
            status: Mutex::new("starting".to_string()),
            thread: Mutex::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub fn shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn reconnections(&self) -> u64 {
        self.nb_db_conn_cycles.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.nb_errors.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> u64 {
        self.nb_jobs_processed.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> String {
        self.status.lock().unwrap().clone()
    }

    fn set_status(&self, s: impl Into<String>) {
        *self.status.lock().unwrap() = s.into();
    }

    #[cfg(test)]
    pub fn mark_running_for_test(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Spawns the run loop on a fresh OS thread, resetting the shutdown
    /// flags so a previously-stopped worker can be reused by
    /// `squale_startup`.
    pub fn spawn(self: &Arc<Self>, pool: Weak<Pool>) {
        self.shutdown_requested.store(false, Ordering::Release);
        self.shutdown_complete.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        let worker = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("squale-worker-{}", self.index))
            .spawn(move || worker.run(pool))
            .expect("failed to spawn worker thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    fn run(self: Arc<Self>, pool: Weak<Pool>) {
        self.set_status("Connecting");
        if !self.connect_until_ready() {
            self.finish();
            return;
        }

        loop {
            if self.shutdown_requested() {
                break;
            }
            let Some(pool_ref) = pool.upgrade() else {
                break;
            };

            self.set_status("Sleeping");
            let job = match pool_ref.assign_or_wait(&self) {
                Some(job) => job,
                None => break,
            };

            self.set_status(job.query());

            if !self.backend.lock().unwrap().is_alive() {
                warn!(worker = self.index, "backend connection lost, giving job back to pool");
                self.nb_db_conn_cycles.fetch_add(1, Ordering::Relaxed);
                pool_ref.giveup(job);
                drop(pool_ref);
                if !self.connect_until_ready() {
                    break;
                }
                continue;
            }

            let execution = self.backend.lock().unwrap().execute(job.query());
            match execution {
                Execution::Rows { fields, rows, warning } => {
                    job.set_rows(&fields, &rows, warning.as_deref());
                },
                Execution::Affected(n) => job.set_affected_rows(n),
                Execution::Error(message) => {
                    self.nb_errors.fetch_add(1, Ordering::Relaxed);
                    job.set_error(message);
                },
            }
            job.transition(JobStatus::Processing, JobStatus::Complete);
            self.nb_jobs_processed.fetch_add(1, Ordering::Relaxed);
            pool_ref.remove(&job);
            drop(pool_ref);

            if self.cycle_after > 0 {
                let n = self.cycle_counter.fetch_add(1, Ordering::Relaxed) + 1;
                if n >= self.cycle_after {
                    self.cycle_counter.store(0, Ordering::Relaxed);
                    self.set_status("Disconnecting");
                    self.backend.lock().unwrap().disconnect();
                    self.nb_db_conn_cycles.fetch_add(1, Ordering::Relaxed);
                    if !self.connect_until_ready() {
                        break;
                    }
                }
            }
        }

        self.set_status("Disconnecting");
        self.backend.lock().unwrap().disconnect();
        self.finish();
    }

    fn finish(&self) {
        self.set_status("Stopped");
        self.running.store(false, Ordering::Release);
        self.shutdown_complete.store(true, Ordering::Release);
    }

    /// Retries `connect` on a 1s cadence until it succeeds or shutdown is
    /// requested. Returns false if it gave up because of shutdown.
    fn connect_until_ready(&self) -> bool {
        loop {
            if self.shutdown_requested() {
                return false;
            }
            match self.backend.lock().unwrap().connect() {
                Ok(()) => return true,
                Err(err) => {
                    error!(worker = self.index, error = %err, "backend connect failed, retrying");
                    std::thread::sleep(RECONNECT_BACKOFF);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::backend::StubBackend;
    use crate::types::job::Job;

    #[test]
    fn worker_processes_a_job_end_to_end() {
        let pool = Pool::new("p", "stub", 0, 0);
        let worker = Worker::new(1, Box::new(StubBackend::new("stub")), 0);
        pool.attach_worker(worker.clone());
        worker.spawn(Arc::downgrade(&pool));

        let job = Arc::new(Job::new("SELECT 42".to_string()));
        pool.add(job.clone()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while job.status() != JobStatus::Complete && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(job.status(), JobStatus::Complete);
        assert_eq!(worker.processed_count(), 1);

        worker.request_shutdown();
        pool.shutdown();
    }

    /// Spec S5: a liveness check that fails once should make the worker
    /// give the job back to the pool, reconnect, and complete it on the
    /// next pass — without the client ever seeing an error.
    #[test]
    fn worker_gives_up_and_reconnects_after_one_dead_liveness_check() {
        let pool = Pool::new("p", "stub", 0, 0);
        let backend = StubBackend::new("stub").fail_liveness_checks(1);
        let worker = Worker::new(1, Box::new(backend), 0);
        pool.attach_worker(worker.clone());
        worker.spawn(Arc::downgrade(&pool));

        let job = Arc::new(Job::new("SELECT 1".to_string()));
        pool.add(job.clone()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while job.status() != JobStatus::Complete && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(job.status(), JobStatus::Complete);
        assert_eq!(worker.reconnections(), 1);
        assert!(!job.is_error());

        worker.request_shutdown();
        pool.shutdown();
    }

    /// Spec S6: broadcasting shutdown while jobs are in flight must not
    /// strand any worker — each one finishes its current job, then stops.
    #[test]
    fn shutdown_mid_work_still_reaches_shutdown_complete_on_every_worker() {
        let pool = Pool::new("p", "stub", 0, 0);
        let workers: Vec<_> = (1..=2)
            .map(|idx| {
                let worker = Worker::new(idx, Box::new(StubBackend::new("stub")), 0);
                pool.attach_worker(worker.clone());
                worker.spawn(Arc::downgrade(&pool));
                worker
            })
            .collect();

        let jobs: Vec<_> = (0..4)
            .map(|_| {
                let job = Arc::new(Job::new("SELECT 1".to_string()));
                pool.add(job.clone()).unwrap();
                job
            })
            .collect();

        pool.request_all_workers_shutdown();

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !workers.iter().all(|w| w.shutdown_complete()) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(workers.iter().all(|w| w.shutdown_complete()), "not every worker reached shutdown_complete");
        assert!(jobs.iter().all(|j| j.status() == JobStatus::Complete || j.status() == JobStatus::Pending));
    }
}
