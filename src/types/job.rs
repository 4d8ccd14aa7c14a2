use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::Notify;

use crate::wire::protocol::encode_rows;

/// Process-wide monotonically increasing job id source.
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a job, derived once from the raw query string by
/// exact-match (plus optional trailing whitespace) against the reserved
/// control-verb table. Deliberately not a prefix match: a prefix match
/// would make e.g. `squale_shutdownXYZ` match `squale_shutdown`, which
/// is surprising enough to treat as a bug rather than a feature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobKind {
    Normal,
    GlobalStats,
    LocalStats,
    Startup,
    Shutdown,
    GlobalShutdown,
}

pub const VERB_GLOBAL_STATS: &str = "squale_global_stats";
pub const VERB_LOCAL_STATS: &str = "squale_local_stats";
pub const VERB_STARTUP: &str = "squale_startup";
pub const VERB_SHUTDOWN: &str = "squale_shutdown";
pub const VERB_GLOBAL_SHUTDOWN: &str = "squale_global_shutdown";

impl JobKind {
    pub fn classify(query: &str) -> JobKind {
        match query.trim_end() {
            VERB_GLOBAL_STATS => JobKind::GlobalStats,
            VERB_LOCAL_STATS => JobKind::LocalStats,
            VERB_STARTUP => JobKind::Startup,
            VERB_SHUTDOWN => JobKind::Shutdown,
            VERB_GLOBAL_SHUTDOWN => JobKind::GlobalShutdown,
            _ => JobKind::Normal,
        }
    }

    pub fn is_control_verb(&self) -> bool {
        !matches!(self, JobKind::Normal)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
}

/// The mutually-exclusive outcomes a completed job can carry, already
/// encoded as the wire-format resultset body where applicable (see
/// `wire::protocol::encode_rows`). The reserved 9-byte timing/kind header
/// is *not* included here: it is filled in by the client task at
/// response-serialization time, once assignation/processing timings are
/// known, rather than spliced into a buffer the worker already grew.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    Rows { body: bytes::Bytes, warning: bool },
    Affected(u64),
    Error(String),
}

struct Inner {
    status: JobStatus,
    outcome: Option<JobOutcome>,
    assigned_at: Option<Instant>,
    completed_at: Option<Instant>,
}

/// A single client request: a query string or a recognized control verb,
/// tracked through PENDING -> PROCESSING -> COMPLETE.
pub struct Job {
    id: JobId,
    kind: JobKind,
    query: String,
    created_at: Instant,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Job {
    pub fn new(query: String) -> Self {
        let kind = JobKind::classify(&query);
        Job {
            id: JobId::next(),
            kind,
            query,
            created_at: Instant::now(),
            inner: Mutex::new(Inner {
                status: JobStatus::Pending,
                outcome: None,
                assigned_at: None,
                completed_at: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn status(&self) -> JobStatus {
        self.inner.lock().unwrap().status
    }

    /// Atomically transitions `from` -> `to` under the job mutex. Only
    /// PENDING->PROCESSING, PENDING->COMPLETE, PROCESSING->COMPLETE, and
    /// PROCESSING->PENDING (used by `giveup`) are meaningful; anything else
    /// always fails. Returns whether the transition happened; the caller
    /// must not assume side effects occurred on `false`.
    pub fn transition(&self, from: JobStatus, to: JobStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != from {
            return false;
        }
        inner.status = to;
        match to {
            JobStatus::Processing => {
                inner.assigned_at = Some(Instant::now());
            },
            JobStatus::Complete => {
                inner.completed_at = Some(Instant::now());
                // Writing the completion notification while still holding
                // the status mutex means any waiter that observes COMPLETE
                // is guaranteed to also observe the notification: the
                // write is inside the same critical section as the CAS.
                self.notify.notify_one();
            },
            JobStatus::Pending => {},
        }
        true
    }

    /// Waits for this job to reach COMPLETE. Tolerant of spurious/coalesced
    /// wakeups: re-checks status on every wake rather than trusting that a
    /// single notification means the job is actually done.
    pub async fn wait_complete(&self) {
        loop {
            if self.status() == JobStatus::Complete {
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.outcome = Some(JobOutcome::Error(message.into()));
    }

    pub fn set_affected_rows(&self, rows: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.outcome = Some(JobOutcome::Affected(rows));
    }

    pub fn set_rows(
        &self,
        fields: &[String],
        rows: &[Vec<Option<Vec<u8>>>],
        warning: Option<&str>,
    ) {
        let body = encode_rows(fields, rows, warning);
        let mut inner = self.inner.lock().unwrap();
        inner.outcome = Some(JobOutcome::Rows { body, warning: warning.is_some() });
    }

    /// Immediately completes a job with a synthetic two-column
    /// ("Name", "Value") resultset and transitions PENDING->COMPLETE. Used
    /// by the stats control verbs, mirroring
    /// `squale_job_complete_from_hashtable` in the original C.
    pub fn complete_from_key_value_map(&self, map: &[(String, String)]) {
        let fields = vec!["Name".to_string(), "Value".to_string()];
        let rows: Vec<Vec<Option<Vec<u8>>>> = map
            .iter()
            .map(|(k, v)| vec![Some(k.clone().into_bytes()), Some(v.clone().into_bytes())])
            .collect();
        self.set_rows(&fields, &rows, None);
        self.transition(JobStatus::Pending, JobStatus::Complete);
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.inner.lock().unwrap().outcome.clone()
    }

    /// Milliseconds between creation and assignment, truncated to i32.
    pub fn assignation_delay_ms(&self) -> i32 {
        let inner = self.inner.lock().unwrap();
        match inner.assigned_at {
            Some(t) => (t - self.created_at).as_millis() as i32,
            None => 0,
        }
    }

    /// Milliseconds between assignment and completion, truncated to i32.
    pub fn processing_time_ms(&self) -> i32 {
        let inner = self.inner.lock().unwrap();
        match (inner.assigned_at, inner.completed_at) {
            (Some(a), Some(c)) => (c - a).as_millis() as i32,
            _ => 0,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome(), Some(JobOutcome::Error(_)))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_exact_control_verbs() {
        assert_eq!(JobKind::classify("squale_global_stats"), JobKind::GlobalStats);
        assert_eq!(JobKind::classify("squale_global_stats  "), JobKind::GlobalStats);
        assert_eq!(JobKind::classify("squale_global_statsXYZ"), JobKind::Normal);
        assert_eq!(JobKind::classify("SELECT 1"), JobKind::Normal);
    }

    #[test]
    fn transition_is_one_way_and_guarded() {
        let job = Job::new("SELECT 1".to_string());
        assert!(job.transition(JobStatus::Pending, JobStatus::Processing));
        assert!(!job.transition(JobStatus::Pending, JobStatus::Processing));
        assert!(job.transition(JobStatus::Processing, JobStatus::Complete));
        assert_eq!(job.status(), JobStatus::Complete);
    }

    #[tokio::test]
    async fn wait_complete_resolves_after_transition() {
        let job = std::sync::Arc::new(Job::new("SELECT 1".to_string()));
        let waiter = {
            let job = job.clone();
            tokio::spawn(async move {
                job.wait_complete().await;
            })
        };
        // Give the waiter a chance to register before completing.
        tokio::task::yield_now().await;
        job.transition(JobStatus::Pending, JobStatus::Processing);
        job.transition(JobStatus::Processing, JobStatus::Complete);
        waiter.await.unwrap();
    }
}
