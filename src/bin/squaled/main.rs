//! Entry point. Grounded on `squale.c`'s `main`: parse options, daemonize
//! (skipped here — see DESIGN.md for why), wire up the five signals it
//! handles (TERM/INT quit, HUP log rotation, PIPE/XFSZ ignored), load the
//! topology, open the listener, and run until asked to stop.

mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use squale::config::Topology;
use squale::logging::{LogLevel, LogTarget};
use squale::server::Squale;

/// Startup failures (bad config, can't bind the listener) are reported as
/// -1, which two's-complements to 255 as a process exit code.
const EXIT_STARTUP_FAILURE: i32 = 255;

fn main() -> std::process::ExitCode {
    let args = match args::Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // clap already knows how to print usage/help to the right stream.
            let _ = err.print();
            let help_or_version = matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp
                    | clap::error::ErrorKind::DisplayVersion
                    | clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            );
            // Bad CLI arguments exit 1; --help/--version are not "bad
            // arguments" and exit cleanly.
            return std::process::ExitCode::from(if help_or_version { 0 } else { 1 });
        },
    };

    tokio::runtime::Runtime::new().expect("failed to start the tokio runtime").block_on(run(args))
}

async fn run(args: args::Args) -> std::process::ExitCode {
    match try_run(args).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "squaled exiting after a startup failure");
            std::process::ExitCode::from(EXIT_STARTUP_FAILURE as u8)
        },
    }
}

async fn try_run(args: args::Args) -> anyhow::Result<()> {
    let topology = Topology::load(&args.config_file)
        .with_context(|| format!("loading configuration file {}", args.config_file.display()))?;

    let log_file = args.log_file.or_else(|| topology.log_file.clone().map(Into::into));
    let log_level = match args.log_level {
        Some(level) => Some(level),
        None => match &topology.log_level {
            Some(raw) => Some(raw.parse::<LogLevel>().context("parsing log_level from configuration file")?),
            None => None,
        },
    };

    let log_target = if args.no_detach {
        LogTarget::new(None)
    } else {
        LogTarget::new(log_file.clone())
    }
    .context("opening log file")?;

    init_tracing(&log_target, log_level, args.no_detach);

    let server = Squale::from_topology(&topology, log_target).context("building server state from configuration")?;

    info!(socket = server.socket_name(), "starting squaled");

    let socket_path = std::path::PathBuf::from(server.socket_name());
    let listener =
        squale::listener::bind(&socket_path).with_context(|| format!("binding unix socket {}", socket_path.display()))?;

    let shutdown_rx = server.shutdown_watch();
    let accept_task = {
        let server = server.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            squale::listener::accept_loop(listener, shutdown_rx, move |stream| {
                let server = server.clone();
                async move { squale::client::handle(server, stream).await }
            })
            .await;
        })
    };

    run_signal_loop(server.clone()).await;

    accept_task.abort();
    server.wait_for_workers_to_stop(std::time::Duration::from_secs(5)).await;
    // The socket file is created at startup and unlinked on clean shutdown.
    let _ = std::fs::remove_file(&socket_path);
    info!("squaled stopped");
    Ok(())
}

/// Listens for TERM/INT (graceful quit), HUP (log reopen), and ignores
/// PIPE/XFSZ, matching the signal table wired up in `squale.c`'s `main`.
/// Returns once a quit signal has been received or the server shuts
/// itself down (e.g. via `squale_global_shutdown`).
async fn run_signal_loop(server: Arc<Squale>) {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut pipe = signal(SignalKind::pipe()).expect("failed to install SIGPIPE handler");
    let mut xfsz = signal(SignalKind::from_raw(25)).expect("failed to install SIGXFSZ handler");
    let mut shutdown_rx = server.shutdown_watch();

    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("received SIGTERM, exiting");
                server.shutdown_all();
                return;
            },
            _ = int.recv() => {
                info!("received SIGINT, exiting");
                server.shutdown_all();
                return;
            },
            _ = hup.recv() => {
                info!("received SIGHUP, reopening log file");
                if let Err(error) = server.log_target.reopen() {
                    error!(%error, "failed to reopen log file");
                }
            },
            _ = pipe.recv() => {},
            _ = xfsz.recv() => {},
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    return;
                }
            },
        }
    }
}

fn init_tracing(log_target: &LogTarget, log_level: Option<LogLevel>, no_detach: bool) {
    let directive = log_level.map(|l| l.as_filter_directive()).unwrap_or("info");
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(log_target.clone());

    if no_detach {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }
}
