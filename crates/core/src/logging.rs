//! Tracing filter selection, rolling file sink and crash artifacts.
//!
//! The subscriber itself is assembled by the binary; this module decides
//! which filters apply, prepares the daily rolling log file under
//! `<data_dir>/logs` and installs a panic hook that persists crash reports
//! under `<data_dir>/logs/crash`.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
/// Extra directive the file sink gets when the filter is implicit, so frame
/// reports land in the log file without flooding the console.
pub const FILE_DETAIL_FILTER: &str = "tilerp_core::pipeline=debug";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "tilerp";
pub const LOG_FILE_SUFFIX: &str = "log";

static HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static HOOK_WRITING: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log: Option<String>,
    pub default_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_filter: None,
            rust_log: None,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPlan {
    /// Filter chosen by the user, before noise directives are added.
    pub user: String,
    pub console: String,
    pub file: String,
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Unavailable {
        log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Unavailable { log_dir, .. } => log_dir.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookStatus {
    Installed { crash_dir: PathBuf },
    AlreadyInstalled { crash_dir: PathBuf },
    Unavailable { crash_dir: Option<PathBuf>, reason: String },
}

/// Filter precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
/// the default. Noise directives are only prepended when the user did not
/// pick a filter on the command line.
pub fn plan_filters(options: &LoggingOptions) -> FilterPlan {
    let user = if let Some(filter) = options.cli_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log.as_deref() {
        filter.to_string()
    } else {
        options.default_filter.clone()
    };

    let implicit = options.cli_filter.is_none() && options.verbose == 0;
    if !implicit {
        return FilterPlan {
            console: user.clone(),
            file: user.clone(),
            user,
        };
    }

    let console = join_directives(&[options.noise_filter.as_str(), user.as_str()]);
    let file = join_directives(&[
        options.noise_filter.as_str(),
        user.as_str(),
        FILE_DETAIL_FILTER,
    ]);
    FilterPlan {
        user,
        console,
        file,
    }
}

fn join_directives(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Create the daily rolling appender under `<data_dir>/logs`.
pub fn open_file_sink(options: &LoggingOptions) -> FileSink {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::Unavailable {
            log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::Unavailable {
            log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSink::Ready { log_dir, appender },
        Err(error) => FileSink::Unavailable {
            log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

/// Install a process-wide panic hook writing crash reports under
/// `<data_dir>/logs/crash`. The previous hook still runs afterwards.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookStatus {
    if let Some(crash_dir) = HOOK_CRASH_DIR.get() {
        return PanicHookStatus::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }
    let Some(data_dir) = data_dir else {
        return PanicHookStatus::Unavailable {
            crash_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookStatus::Unavailable {
            crash_dir: Some(crash_dir),
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let _guard = HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = HOOK_CRASH_DIR.get() {
        return PanicHookStatus::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        persist_crash_report(&hook_dir, info);
        previous(info);
    }));

    let _ = HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookStatus::Installed { crash_dir }
}

#[derive(Debug)]
struct CrashReport {
    timestamp: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)",
                "<disabled>".to_string(),
            ),
            _ => ("unsupported", "<unavailable>".to_string()),
        };

        Self {
            timestamp: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));

        let mut file = fs::File::create(&path)?;
        writeln!(file, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(file, "thread={}", self.thread)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "payload={}", self.payload)?;
        writeln!(file, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(file, "backtrace:")?;
        writeln!(file, "{}", self.backtrace)?;
        file.flush()?;
        Ok(path)
    }
}

fn persist_crash_report(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic inside the hook must not recurse into another report.
    if HOOK_WRITING
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    HOOK_WRITING.store(false, Ordering::Release);
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
