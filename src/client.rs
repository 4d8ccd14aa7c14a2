//! Per-connection handling. Grounded on `squaleclient.c`'s
//! `SqualeClientStatus` state machine (`STARTUP` reads the pool name,
//! `CONNECTION` reads the query, `PROCESSING` waits on the job, `SENDING`
//! flushes the reply) and `squale_client_execute_system_order` for the
//! control-verb dispatch table. One connection serves exactly one request:
//! after the reply is sent the socket is closed, matching the original.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tracing::{info, warn};

use crate::server::Squale;
use crate::types::job::{Job, JobKind, JobOutcome};
use crate::wire::protocol::{Reply, Request};

/// Time budget for a client to finish sending its pool name and query.
/// Grounded on `squale_client_timeout_cb` in `squaleclient.c`.
const PROTOCOL_TIMEOUT: Duration = Duration::from_millis(1000);

pub async fn handle(server: Arc<Squale>, stream: UnixStream) {
    server.client_connected();
    let result = serve(&server, stream).await;
    server.client_disconnected();
    if let Err(error) = result {
        warn!(%error, "client connection ended with an error");
    }
}

async fn serve(server: &Arc<Squale>, stream: UnixStream) -> Result<(), crate::wire::encoder::Error> {
    let mut framed = crate::wire::framed(stream);

    let request = match tokio::time::timeout(PROTOCOL_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(request))) => request,
        Ok(Some(Err(error))) => {
            warn!(%error, "malformed request");
            return Ok(());
        },
        Ok(None) => return Ok(()),
        Err(_) => {
            warn!("client did not finish its request within the protocol timeout");
            return Ok(());
        },
    };

    let reply = dispatch(server, request).await;
    framed.send(reply).await?;
    Ok(())
}

async fn dispatch(server: &Arc<Squale>, request: Request) -> Reply {
    let Request { pool: pool_name, query } = request;

    let job = Arc::new(Job::new(query));

    // `squale_global_stats` and `squale_global_shutdown` answer regardless
    // of whether `pool_name` matches anything; every other verb (and plain
    // NORMAL queries) requires a matching pool.
    match job.kind() {
        JobKind::GlobalStats => {
            job.complete_from_key_value_map(&server.global_stats());
        },
        JobKind::GlobalShutdown => run_global_shutdown(server, &job),
        _ => {
            let pool = match server.pool_by_name(&pool_name) {
                Some(pool) => pool.clone(),
                None => return error_reply(format!("pool '{pool_name}' does not exist")),
            };

            if job.kind().is_control_verb() {
                run_control_verb(&pool, &job);
            } else if let Err(error) = pool.add(job.clone()) {
                return error_reply(error.to_string());
            }
        },
    }

    job.wait_complete().await;
    reply_from_outcome(&job)
}

/// Executes a recognized pool-scoped control verb synchronously and
/// completes `job` before returning, matching
/// `squale_client_execute_system_order`'s immediate (non-worker) handling
/// of these verbs. `GlobalStats`/`GlobalShutdown` are handled by the caller
/// before a pool is even looked up.
fn run_control_verb(pool: &Arc<crate::types::pool::Pool>, job: &Arc<Job>) {
    match job.kind() {
        JobKind::LocalStats => {
            job.complete_from_key_value_map(&pool.local_stats());
        },
        JobKind::Startup => {
            pool.startup();
            job.complete_from_key_value_map(&[("Status".to_string(), "OK".to_string())]);
        },
        JobKind::Shutdown => {
            pool.shutdown();
            job.complete_from_key_value_map(&[("Status".to_string(), "OK".to_string())]);
        },
        JobKind::GlobalStats | JobKind::GlobalShutdown | JobKind::Normal => {
            unreachable!("run_control_verb called on a job handled elsewhere")
        },
    }
}

/// `squale_global_shutdown`: replies OK, then tears the whole process down
/// once the reply has had a chance to reach the client.
fn run_global_shutdown(server: &Arc<Squale>, job: &Arc<Job>) {
    job.complete_from_key_value_map(&[("Status".to_string(), "OK".to_string())]);
    let server = server.clone();
    // The reply for this job still needs to reach the client, so the
    // actual process-wide shutdown is deferred one tick: `serve` sends the
    // reply right after `dispatch` returns, and only then does this task
    // run.
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        info!("squale_global_shutdown received, stopping the process");
        server.shutdown_all();
    });
}

fn reply_from_outcome(job: &Job) -> Reply {
    let assign_ms = job.assignation_delay_ms();
    let process_ms = job.processing_time_ms();
    match job.outcome() {
        Some(JobOutcome::Rows { body, warning }) => Reply::Rows { assign_ms, process_ms, warning, body },
        Some(JobOutcome::Affected(rows)) => Reply::Affected { assign_ms, process_ms, rows },
        Some(JobOutcome::Error(message)) => Reply::Error { assign_ms, process_ms, message },
        None => Reply::Error { assign_ms, process_ms, message: "job completed without an outcome".to_string() },
    }
}

fn error_reply(message: String) -> Reply {
    Reply::Error { assign_ms: 0, process_ms: 0, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topology;
    use crate::logging::LogTarget;

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

    #[tokio::test]
    async fn unknown_pool_yields_error_reply() {
        let server = Squale::from_topology(&topology(), LogTarget::new(None).unwrap()).unwrap();
        let reply = dispatch(&server, Request { pool: "nope".to_string(), query: "SELECT 1".to_string() }).await;
        assert!(matches!(reply, Reply::Error { .. }));
    }

    #[tokio::test]
    async fn normal_query_runs_through_the_pool_worker() {
        let server = Squale::from_topology(&topology(), LogTarget::new(None).unwrap()).unwrap();
        let reply =
            dispatch(&server, Request { pool: "main".to_string(), query: "SELECT 42".to_string() }).await;
        match reply {
            Reply::Rows { warning, .. } => assert!(!warning),
            other => panic!("expected a rows reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_stats_control_verb_is_answered_without_a_worker() {
        let server = Squale::from_topology(&topology(), LogTarget::new(None).unwrap()).unwrap();
        let reply = dispatch(
            &server,
            Request { pool: "main".to_string(), query: "squale_local_stats".to_string() },
        )
        .await;
        assert!(matches!(reply, Reply::Rows { .. }));
    }

    #[tokio::test]
    async fn global_stats_answers_even_with_an_unmatched_pool_name() {
        let server = Squale::from_topology(&topology(), LogTarget::new(None).unwrap()).unwrap();
        let reply = dispatch(
            &server,
            Request { pool: "does-not-exist".to_string(), query: "squale_global_stats".to_string() },
        )
        .await;
        assert!(matches!(reply, Reply::Rows { .. }));
    }

    #[tokio::test]
    async fn admission_block_error_reply_mentions_blocked_and_the_pending_count() {
        use crate::types::backend::StubBackend;
        use crate::types::job::Job;
        use crate::types::pool::Pool;
        use crate::types::worker::Worker;

        // A pool whose single worker never actually runs (we never spawn
        // it), so every submitted job stays PENDING and the block
        // threshold is reached deterministically, matching spec S2.
        let pool = Pool::new("p", "stub", 0, 2);
        let worker = Worker::new(1, Box::new(StubBackend::new("stub")), 0);
        worker.mark_running_for_test();
        pool.attach_worker(worker);

        pool.add(Arc::new(Job::new("SELECT 1".to_string()))).unwrap();
        pool.add(Arc::new(Job::new("SELECT 1".to_string()))).unwrap();
        let error = pool.add(Arc::new(Job::new("SELECT 1".to_string()))).unwrap_err();

        let message = error.to_string();
        assert!(message.contains("blocked"), "message was: {message}");
        assert!(message.contains('2'), "message was: {message}");
    }

    #[tokio::test]
    async fn local_stats_with_an_unmatched_pool_name_fails() {
        let server = Squale::from_topology(&topology(), LogTarget::new(None).unwrap()).unwrap();
        let reply = dispatch(
            &server,
            Request { pool: "does-not-exist".to_string(), query: "squale_local_stats".to_string() },
        )
        .await;
        match reply {
            Reply::Error { message, .. } => assert!(message.contains("does not exist")),
            other => panic!("expected an error reply, got {other:?}"),
        }
    }
}
