//! Tracing filter selection, the rolling log file sink, and panic crash
//! artifacts. Subscriber assembly itself lives in the binary.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fmt, fs,
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
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,wgpu_core=warn,wgpu_hal=warn,naga=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "midframe";
pub const LOG_FILE_SUFFIX: &str = "log";

/// Per-tile timings are debug events; the file keeps them even when the
/// console runs at the default level.
const FILE_DETAIL_DIRECTIVE: &str = "midframe_core=debug";

static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl LoggingInitOptions {
    /// True when neither `--log-filter` nor `-v` picked the level.
    fn is_implicit(&self) -> bool {
        self.cli_log_filter.is_none() && self.verbose == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Rolling {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Rolling { .. })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Rolling { log_dir, .. } => Some(log_dir),
            Self::ConsoleOnly {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Rolling { .. } => None,
            Self::ConsoleOnly { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed { crash_dir: PathBuf },
    AlreadyInstalled { crash_dir: PathBuf },
    Fallback { reason: String },
}

/// Pick the user-facing filter: `--log-filter`, then `-vv`/`-v`, then
/// `RUST_LOG`, then the default.
pub fn select_user_filter(options: &LoggingInitOptions) -> String {
    match (&options.cli_log_filter, options.verbose, &options.rust_log_env) {
        (Some(filter), _, _) => filter.clone(),
        (None, v, _) if v >= 2 => "trace".to_string(),
        (None, 1, _) => "debug".to_string(),
        (None, _, Some(env)) if !env.trim().is_empty() => env.clone(),
        _ => options.default_log_filter.clone(),
    }
}

fn join_directives<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let implicit = options.is_implicit();
    let noise = if implicit && options.include_noise_filter_when_implicit {
        options.noise_filter.as_str()
    } else {
        ""
    };

    let console_filter = join_directives([noise, user_filter.as_str()]);
    let file_filter = if implicit {
        join_directives([noise, user_filter.as_str(), FILE_DETAIL_DIRECTIVE])
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = match options.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        n => n,
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::ConsoleOnly {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Rolling {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Install a once-only hook that writes a crash artifact under
/// `<data_dir>/logs/crash` and then chains to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            reason: format!(
                "failed to create crash directory {}: {error}",
                crash_dir.display()
            ),
        };
    }

    let _guard = CRASH_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
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

    fn file_name(&self, sequence: u64) -> String {
        format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        )
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(self.file_name(sequence));
        let mut file = fs::File::create(&path)?;
        write!(file, "{self}")?;
        file.flush()?;
        Ok(path)
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(f, "thread={}", self.thread)?;
        writeln!(f, "location={}", self.location)?;
        writeln!(f, "payload={}", self.payload)?;
        writeln!(f, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(f, "backtrace:")?;
        writeln!(f, "{}", self.backtrace)
    }
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the artifact must not recurse into this hook.
    if CRASH_WRITE_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic while writing crash artifact under '{}'",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_IN_PROGRESS.store(false, Ordering::Release);
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
