//! The server root, gathering every pool plus the handful of fields the
//! original keeps on its single `Squale` struct (`squale.h`): a startup
//! timestamp, a connected-client counter, the socket path, and the log
//! target. Constructed once in `main` and shared as `Arc<Squale>` so global
//! process state lives on one root struct passed explicitly rather than
//! hiding behind statics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::config::{ConfigError, Topology};
use crate::logging::LogTarget;
use crate::types::backend::StubBackend;
use crate::types::pool::Pool;
use crate::types::worker::Worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Squale {
    pools: Vec<Arc<Pool>>,
    startup: Instant,
    connected_clients: AtomicU64,
    socket_name: String,
    pub log_target: LogTarget,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Squale {
    pub fn from_topology(topology: &Topology, log_target: LogTarget) -> Result<Arc<Squale>, ConfigError> {
        let mut pools = Vec::with_capacity(topology.pools.len());
        for pool_cfg in &topology.pools {
            let pool = Pool::new(
                pool_cfg.name.clone(),
                pool_cfg.backend.clone(),
                pool_cfg.max_pending_warn,
                pool_cfg.max_pending_block,
            );
            for (idx, worker_cfg) in pool_cfg.workers.iter().enumerate() {
                let backend = make_backend(&pool_cfg.backend)
                    .ok_or_else(|| ConfigError::UnknownBackend(pool_cfg.backend.clone()))?;
                let worker = Worker::new(idx + 1, backend, worker_cfg.cycle_after);
                worker.spawn(Arc::downgrade(&pool));
                pool.attach_worker(worker);
            }
            pools.push(pool);
        }

        let (shutdown, _) = tokio::sync::watch::channel(false);

        Ok(Arc::new(Squale {
            pools,
            startup: Instant::now(),
            connected_clients: AtomicU64::new(0),
            socket_name: topology.socket_name().to_string(),
            log_target,
            shutdown,
        }))
    }

    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Case-insensitive lookup, matching `g_ascii_strcasecmp` in
    /// `squale_client_execute`.
    pub fn pool_by_name(&self, name: &str) -> Option<&Arc<Pool>> {
        self.pools.iter().find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
    }

    /// The `squale_global_stats` control verb. Key vocabulary matches
    /// `squale_stats_client` in `squale.c`.
    pub fn global_stats(&self) -> Vec<(String, String)> {
        let connections = self.pools.iter().map(|p| p.name().to_string()).collect::<Vec<_>>().join(", ");
        vec![
            ("uptime (s)".to_string(), self.startup.elapsed().as_secs().to_string()),
            ("version".to_string(), VERSION.to_string()),
            ("connected_clients".to_string(), self.connected_clients.load(Ordering::Relaxed).to_string()),
            ("connections".to_string(), connections),
        ]
    }

    pub fn shutdown_watch(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// `squale_global_shutdown`: stops every pool's workers and signals
    /// the listener + main loop to stop accepting and exit.
    pub fn shutdown_all(&self) {
        info!("global shutdown requested");
        for pool in &self.pools {
            pool.shutdown();
        }
        let _ = self.shutdown.send(true);
    }

    /// Waits (bounded) for every worker in every pool to finish its
    /// in-flight job and stop, used by the signal-driven graceful exit
    /// path before the process actually terminates.
    pub async fn wait_for_workers_to_stop(&self, timeout: std::time::Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.pools.iter().all(|p| p.all_workers_shutdown_complete()) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

fn make_backend(tag: &str) -> Option<Box<dyn crate::types::backend::Backend>> {
    match tag {
        "stub" => Some(Box::new(StubBackend::new("stub"))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> Topology {
        Topology::parse(
            r#"
pools:
  - name: main
    backend: stub
    workers:
      - cycle_after: 0
"#,
        )
        .unwrap()
    }

    #[test]
    fn from_topology_builds_one_pool_with_one_worker() {
        let squale = Squale::from_topology(&topology(), LogTarget::new(None).unwrap()).unwrap();
        assert_eq!(squale.pools().len(), 1);
        assert!(squale.pool_by_name("MAIN").is_some());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let topology = Topology::parse(
            r#"
pools:
  - name: main
    backend: oracle
    workers:
      - cycle_after: 0
"#,
        )
        .unwrap();
        assert!(Squale::from_topology(&topology, LogTarget::new(None).unwrap()).is_err());
    }

    #[test]
    fn global_stats_lists_pool_names() {
        let squale = Squale::from_topology(&topology(), LogTarget::new(None).unwrap()).unwrap();
        let stats = squale.global_stats();
        assert!(stats.iter().any(|(k, v)| k == "connections" && v == "main"));
    }
}
