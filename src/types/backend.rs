//! The backend capability set a concrete per-database Worker variant must
//! implement: connect, disconnect, execute, is_alive. Database-driver
//! -specific result marshalling is intentionally not part of this crate;
//! this module defines the trait boundary plus one deterministic
//! in-memory implementation used for tests and the bundled demo topology.
//! Real drivers (MySQL/PostgreSQL/Oracle, as the original C had one
//! worker subclass per engine) plug in here.

use std::collections::VecDeque;

/// Transient, retryable failure connecting to a backend. There are no
/// fatal connect errors at this layer: the worker retries every second
/// until success or shutdown.
#[derive(Debug, Clone)]
pub struct ConnectError(pub String);

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ConnectError {}

/// The outcome of executing one query against a connected backend.
pub enum Execution {
    Rows {
        fields: Vec<String>,
        rows: Vec<Vec<Option<Vec<u8>>>>,
        warning: Option<String>,
    },
    Affected(u64),
    Error(String),
}

/// Per-pool concrete backend implementation. A `Backend` instance is owned
/// exclusively by one `Worker` for its entire lifetime; methods take
/// `&mut self` accordingly — there is never contention on a single
/// backend's connection.
pub trait Backend: Send {
    /// Establish (or re-establish) the backend connection. Only transient
    /// errors exist at this layer; the worker retries on a 1s cadence.
    fn connect(&mut self) -> Result<(), ConnectError>;

    /// Best-effort teardown. Also where a commit-every policy should flush
    /// any outstanding non-select work.
    fn disconnect(&mut self);

    /// Liveness probe run before handing a worker its next job.
    fn is_alive(&mut self) -> bool;

    /// Run one query to completion.
    fn execute(&mut self, query: &str) -> Execution;

    /// Human-readable tag used in pool stats (e.g. "postgresql", "stub").
    fn tag(&self) -> &str;
}

/// A deterministic, in-memory backend for tests and demos. Queries are
/// dispatched on trivial textual conventions rather than real SQL parsing:
///
/// - `SELECT <n>` returns one row, one column `c`, with cell value `<n>`.
/// - `FAIL` always returns a driver error.
/// - Anything else is treated as a non-select statement and reports one
///   affected row.
///
/// `StubBackend` can additionally be configured to fail a bounded number of
/// liveness checks and/or connect attempts, to exercise the worker's
/// reconnect-on-loss path.
pub struct StubBackend {
    name: String,
    connected: bool,
    fail_next_connects: usize,
    fail_next_alive_checks: usize,
    commits: u64,
    pending_commits: VecDeque<()>,
    commit_every: Option<u64>,
}

impl StubBackend {
    pub fn new(name: impl Into<String>) -> Self {
        StubBackend {
            name: name.into(),
            connected: false,
            fail_next_connects: 0,
            fail_next_alive_checks: 0,
            commits: 0,
            pending_commits: VecDeque::new(),
            commit_every: None,
        }
    }

    pub fn with_commit_every(mut self, n: u64) -> Self {
        self.commit_every = Some(n);
        self
    }

    pub fn fail_connects(mut self, n: usize) -> Self {
        self.fail_next_connects = n;
        self
    }

    pub fn fail_liveness_checks(mut self, n: usize) -> Self {
        self.fail_next_alive_checks = n;
        self
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }
}

impl Backend for StubBackend {
    fn connect(&mut self) -> Result<(), ConnectError> {
        if self.fail_next_connects > 0 {
            self.fail_next_connects -= 1;
            return Err(ConnectError(format!("{} refused connection", self.name)));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.commits += self.pending_commits.len() as u64;
        self.pending_commits.clear();
    }

    fn is_alive(&mut self) -> bool {
        if self.fail_next_alive_checks > 0 {
            self.fail_next_alive_checks -= 1;
            self.connected = false;
            return false;
        }
        self.connected
    }

    fn execute(&mut self, query: &str) -> Execution {
        let trimmed = query.trim();
        if trimmed.eq_ignore_ascii_case("FAIL") {
            return Execution::Error("stub backend forced failure".to_string());
        }
        if let Some(rest) = trimmed
            .strip_prefix("SELECT ")
            .or_else(|| trimmed.strip_prefix("select "))
        {
            return Execution::Rows {
                fields: vec!["c".to_string()],
                rows: vec![vec![Some(rest.trim().as_bytes().to_vec())]],
                warning: None,
            };
        }
        self.pending_commits.push_back(());
        if let Some(every) = self.commit_every {
            if self.pending_commits.len() as u64 >= every {
                self.commits += self.pending_commits.len() as u64;
                self.pending_commits.clear();
            }
        }
        Execution::Affected(1)
    }

    fn tag(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_returns_one_row_one_field() {
        let mut b = StubBackend::new("stub");
        b.connect().unwrap();
        match b.execute("SELECT 1") {
            Execution::Rows { fields, rows, warning } => {
                assert_eq!(fields, vec!["c".to_string()]);
                assert_eq!(rows, vec![vec![Some(b"1".to_vec())]]);
                assert!(warning.is_none());
            },
            _ => panic!("expected rows"),
        }
    }

    #[test]
    fn non_select_reports_affected_row() {
        let mut b = StubBackend::new("stub");
        b.connect().unwrap();
        match b.execute("UPDATE t SET x = 1") {
            Execution::Affected(n) => assert_eq!(n, 1),
            _ => panic!("expected affected rows"),
        }
    }

    #[test]
    fn fail_query_reports_error() {
        let mut b = StubBackend::new("stub");
        b.connect().unwrap();
        match b.execute("FAIL") {
            Execution::Error(_) => {},
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn liveness_check_can_be_made_to_fail_once() {
        let mut b = StubBackend::new("stub").fail_liveness_checks(1);
        b.connect().unwrap();
        assert!(!b.is_alive());
        b.connect().unwrap();
        assert!(b.is_alive());
    }
}
