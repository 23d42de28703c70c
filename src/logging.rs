use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode};
use log::{LevelFilter, Record};
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy)]
struct LineFormat {
    pid: bool,
    caller: bool,
    trace_id: bool,
}

impl Default for LineFormat {
    fn default() -> Self {
        Self {
            pid: true,
            caller: false,
            trace_id: false,
        }
    }
}

static LINE_FORMAT: OnceLock<LineFormat> = OnceLock::new();

task_local! {
    static TRACE_ID: String;
}

/// Installs the process logger. `verbose` forces debug level regardless of
/// `logger.level`.
pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };
    LINE_FORMAT.get_or_init(|| LineFormat {
        pid: !config.nopid,
        caller: config.caller,
        trace_id: config.traceid,
    });

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(format_line);

    let path = config.path.trim();
    if !path.is_empty() {
        let spec = FileSpec::try_from(Path::new(path)).context("logger.path")?;
        logger = logger.log_to_file(spec).format(format_line);
        if config.max_size > 0 {
            logger = logger.rotate(
                Criterion::Size(config.max_size * 1024 * 1024),
                Naming::Numbers,
                cleanup_policy(config),
            );
        }
        logger = logger.write_mode(WriteMode::BufferAndFlush);
    }
    logger.start().context("start logger")?;

    if let Some(days) = config.max_age.filter(|days| *days > 0) {
        if !path.is_empty() {
            spawn_age_cleanup(PathBuf::from(path), Duration::from_secs(days * 24 * 60 * 60));
        }
    }
    Ok(())
}

pub fn parse_level(raw: &str) -> LevelFilter {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn cleanup_policy(config: &Logger) -> Cleanup {
    if config.max_backups == 0 {
        return Cleanup::Never;
    }
    let keep = config.max_backups as usize;
    #[cfg(feature = "compress")]
    if config.compress {
        return Cleanup::KeepCompressedFiles(keep);
    }
    Cleanup::KeepLogFiles(keep)
}

fn format_line(writer: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    let fmt = LINE_FORMAT.get().copied().unwrap_or_default();
    write!(writer, "{} [{}]", now.now_utc_owned().format(TIMESTAMP_FORMAT), record.level())?;
    if fmt.pid {
        write!(writer, " pid={}", std::process::id())?;
    }
    if fmt.trace_id {
        let trace_id = TRACE_ID.try_with(|id| id.clone()).unwrap_or_else(|_| "-".to_string());
        write!(writer, " trace_id={trace_id}")?;
    }
    if fmt.caller {
        write!(
            writer,
            " {}:{}",
            record.file().unwrap_or("-"),
            record.line().unwrap_or(0)
        )?;
    }
    writeln!(writer, " {}", record.args())
}

/// Runs `fut` with `trace_id` attached to every log line it emits.
pub async fn with_trace_id<T>(trace_id: String, fut: impl std::future::Future<Output = T>) -> T {
    TRACE_ID.scope(trace_id, fut).await
}

fn spawn_age_cleanup(path: PathBuf, max_age: Duration) {
    std::thread::spawn(move || loop {
        remove_stale_logs(&path, max_age);
        std::thread::sleep(CLEANUP_INTERVAL);
    });
}

fn remove_stale_logs(path: &Path, max_age: Duration) {
    let (Some(dir), Some(base)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
        return;
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(base) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO) > max_age)
            .unwrap_or(false);
        if stale {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
