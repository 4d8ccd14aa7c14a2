//! Command-line flags, mirroring the original `poptOption` table in
//! `squale.c`'s `main`: `-d/--no-detach`, `-c/--config-file`,
//! `-f/--log-file`, `-l/--log-level`.

use std::path::PathBuf;

use clap::Parser;

use squale::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "squaled", about = "A pooled, worker-thread job-dispatch daemon", version)]
pub struct Args {
    /// Don't detach as a daemon and log on stdout.
    #[arg(short = 'd', long = "no-detach")]
    pub no_detach: bool,

    /// Use a specific YAML configuration file.
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: PathBuf,

    /// Write log output to a specific log file, overriding the one named
    /// in the configuration file.
    #[arg(short = 'f', long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Minimum level of log messages written to the log file: one of
    /// ERROR, CRITICAL, WARNING, MESSAGE, INFO, DEBUG (case-insensitive).
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}
