use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;

/// One line per served request, appended to a daily-rotated file or stdout.
#[derive(Debug)]
pub struct AccessLogger {
    sink: Mutex<Sink>,
}

#[derive(Debug)]
enum Sink {
    File {
        path: PathBuf,
        file: File,
        day: String,
    },
    Stdout,
}

/// Fields of one access log line. Empty values are written as `-` and
/// spaces inside a field become `+`.
#[derive(Debug, Default)]
pub struct AccessRecord<'a> {
    pub client_ip: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub protocol: &'a str,
    pub status: u16,
    pub body_bytes: u64,
    pub range: &'a str,
    pub cache_status: &'a str,
    pub user_agent: &'a str,
    pub duration_ms: u128,
    pub request_id: &'a str,
}

impl AccessLogger {
    pub fn new(path: Option<&str>) -> Result<Self> {
        let sink = match path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => {
                let path = PathBuf::from(path);
                let file = open_append(&path)?;
                Sink::File {
                    path,
                    file,
                    day: today(),
                }
            }
            None => Sink::Stdout,
        };
        Ok(Self {
            sink: Mutex::new(sink),
        })
    }

    pub fn log(&self, record: &AccessRecord<'_>) {
        let line = format_record(record);
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        match &mut *sink {
            Sink::File { path, file, day } => {
                let now = today();
                if *day != now {
                    let rotated = PathBuf::from(format!("{}.{}", path.display(), day));
                    let _ = fs::rename(&*path, rotated);
                    match open_append(path) {
                        Ok(next) => *file = next,
                        Err(err) => log::warn!("access log rotate failed: {err:#}"),
                    }
                    *day = now;
                }
                let _ = file.write_all(line.as_bytes());
            }
            Sink::Stdout => {
                let _ = std::io::stdout().write_all(line.as_bytes());
            }
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open access log {}", path.display()))
}

fn today() -> String {
    Local::now().format("%Y%m%d").to_string()
}

pub fn format_record(record: &AccessRecord<'_>) -> String {
    let request_line = format!("{} {} {}", record.method, record.uri, record.protocol);
    let time = Local::now().format("[%d/%b/%Y:%H:%M:%S %z]").to_string();
    let fields = [
        field(record.client_ip),
        field(&time),
        field(&request_line),
        record.status.to_string(),
        record.body_bytes.to_string(),
        field(record.range),
        field(record.cache_status),
        field(record.user_agent),
        record.duration_ms.to_string(),
        field(record.request_id),
    ];
    format!("{}\n", fields.join(" "))
}

fn field(raw: &str) -> String {
    if raw.is_empty() {
        "-".to_string()
    } else {
        raw.replace(' ', "+")
    }
}
