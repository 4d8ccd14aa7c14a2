//! Log destination with SIGHUP-triggered reopen: the log file is guarded
//! by a process-wide mutex and rotation (SIGHUP) reopens it under the
//! same lock. Grounded on `squale.c`'s `squale->log_mutex`/`squale->log_fd`
//! pair and `squale_log_rotate`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Squale's original log-level vocabulary, carried over from GLib's
/// `G_LOG_LEVEL_*` flags (`squalelog.c`'s `squale_log_handler` switches
/// on exactly these six, in decreasing severity). `tracing` only has five
/// levels, so `Critical` folds into `Error` and `Message` folds into
/// `Info` — both were already the closest tracing level in the original's
/// own severity ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Error,
    Critical,
    Warning,
    Message,
    Info,
    Debug,
}

impl LogLevel {
    /// The `tracing_subscriber::EnvFilter` directive this level maps to.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error | LogLevel::Critical => "error",
            LogLevel::Warning => "warn",
            LogLevel::Message | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug)]
pub struct UnknownLogLevel(String);

impl std::fmt::Display for UnknownLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown log level '{}' (expected one of ERROR, CRITICAL, WARNING, MESSAGE, INFO, DEBUG)", self.0)
    }
}
impl std::error::Error for UnknownLogLevel {}

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            "WARNING" => Ok(LogLevel::Warning),
            "MESSAGE" => Ok(LogLevel::Message),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            _ => Err(UnknownLogLevel(s.to_string())),
        }
    }
}

#[derive(Clone)]
pub enum LogTarget {
    Stdout,
    File { path: PathBuf, file: Arc<Mutex<File>> },
}

impl LogTarget {
    /// `None` path keeps logging on stdout (the `--no-detach` case).
    /// `Some(path)` opens (creating/appending) the given file.
    pub fn new(path: Option<PathBuf>) -> io::Result<LogTarget> {
        match path {
            None => Ok(LogTarget::Stdout),
            Some(path) => {
                let file = open(&path)?;
                Ok(LogTarget::File { path, file: Arc::new(Mutex::new(file)) })
            },
        }
    }

    /// Reopens the underlying file in place, replacing the descriptor
    /// held under the log mutex so external log rotation (e.g.
    /// `logrotate` moving the old file aside) picks up a fresh inode
    /// without dropping any in-flight writers.
    pub fn reopen(&self) -> io::Result<()> {
        match self {
            LogTarget::Stdout => Ok(()),
            LogTarget::File { path, file } => {
                let new_file = open(path)?;
                *file.lock().unwrap() = new_file;
                Ok(())
            },
        }
    }
}

fn open(path: &std::path::Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct LogHandle(Arc<Mutex<File>>);

impl Write for LogHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl<'a> MakeWriter<'a> for LogTarget {
    type Writer = Box<dyn Write + Send>;

    fn make_writer(&'a self) -> Self::Writer {
        match self {
            LogTarget::Stdout => Box::new(io::stdout()),
            LogTarget::File { file, .. } => Box::new(LogHandle(file.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_on_stdout_target_is_a_noop() {
        let target = LogTarget::new(None).unwrap();
        assert!(target.reopen().is_ok());
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("Critical".parse::<LogLevel>().unwrap(), LogLevel::Critical);
    }

    #[test]
    fn log_level_rejects_unknown_names() {
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn critical_and_message_fold_into_the_nearest_tracing_level() {
        assert_eq!(LogLevel::Critical.as_filter_directive(), LogLevel::Error.as_filter_directive());
        assert_eq!(LogLevel::Message.as_filter_directive(), LogLevel::Info.as_filter_directive());
    }

    #[test]
    fn file_target_writes_and_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("squale-log-test-{}", std::process::id()));
        let target = LogTarget::new(Some(dir.clone())).unwrap();
        {
            let mut writer = target.make_writer();
            writer.write_all(b"hello\n").unwrap();
        }
        target.reopen().unwrap();
        {
            let mut writer = target.make_writer();
            writer.write_all(b"world\n").unwrap();
        }
        let contents = std::fs::read_to_string(&dir).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.contains("world"));
        let _ = std::fs::remove_file(&dir);
    }
}
