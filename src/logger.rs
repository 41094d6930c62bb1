//! Gateway logger.
//!
//! Writes every record to stderr immediately and batches rows into the
//! `system_logs` SQLite table through a background flusher thread.

use std::path::PathBuf;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::config;

static INIT: Once = Once::new();
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);
static DB_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const FLUSH_BATCH: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
    metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

fn db_path() -> PathBuf {
    let mut p = DB_DIR
        .read()
        .unwrap()
        .clone()
        .or_else(|| config::load().data_dir.map(PathBuf::from))
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    p.push("modelgate");
    std::fs::create_dir_all(&p).ok();
    p.push("modelgate.db");
    p
}

fn open_conn() -> Option<Connection> {
    Connection::open(db_path()).ok()
}

/// Initialize the log table and the background batch writer. Idempotent.
pub fn init(log_dir: Option<&std::path::Path>) {
    if let Some(dir) = log_dir {
        *DB_DIR.write().unwrap() = Some(dir.to_path_buf());
    }
    INIT.call_once(|| {
        if let Some(conn) = open_conn() {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS system_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    source TEXT NOT NULL,
                    message TEXT NOT NULL,
                    metadata TEXT
                )",
                [],
            )
            .ok();
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_system_logs_timestamp
                 ON system_logs(timestamp DESC)",
                [],
            )
            .ok();
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_system_logs_level ON system_logs(level)",
                [],
            )
            .ok();
        }
        spawn_batch_writer();
    });
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();
    *LOG_SENDER.write().unwrap() = Some(tx);

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(FLUSH_BATCH);
        let mut last_flush = Instant::now();

        loop {
            let timeout = FLUSH_INTERVAL
                .checked_sub(last_flush.elapsed())
                .unwrap_or(Duration::ZERO);

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= FLUSH_BATCH || last_flush.elapsed() >= FLUSH_INTERVAL {
                        flush(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if !buffer.is_empty() {
            flush(&mut buffer);
        }
    });
}

fn flush(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }
    let Some(mut conn) = open_conn() else {
        buffer.clear();
        return;
    };
    let Ok(tx) = conn.transaction() else {
        buffer.clear();
        return;
    };
    for msg in buffer.drain(..) {
        let _ = tx.execute(
            "INSERT INTO system_logs (timestamp, level, source, message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![msg.timestamp, msg.level, msg.source, msg.message, msg.metadata],
        );
    }
    let _ = tx.commit();
}

fn min_level() -> LogLevel {
    LogLevel::parse(&config::load().log_level).unwrap_or(LogLevel::Info)
}

fn log_internal(level: LogLevel, source: &str, message: &str, metadata: Option<&str>) {
    if level < min_level() {
        return;
    }

    let timestamp = chrono::Utc::now().timestamp();
    eprintln!(
        "{} [{}] {}: {}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        level.as_str(),
        source,
        message
    );

    let msg = LogMessage {
        timestamp,
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
        metadata: metadata.map(|s| s.to_string()),
    };

    if let Some(sender) = LOG_SENDER.read().unwrap().as_ref() {
        let _ = sender.send(msg);
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message, None);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message, None);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message, None);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message, None);
}

/// Error-level record with a structured JSON metadata payload. Used by the
/// billing-timeout path so the alert carries its dimensions.
pub fn critical(source: &str, message: &str, metadata: &serde_json::Value) {
    log_internal(LogLevel::Error, source, message, Some(&metadata.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn level_roundtrip() {
        for s in ["debug", "info", "warn", "error"] {
            assert_eq!(LogLevel::parse(s).unwrap().as_str(), s);
        }
        assert!(LogLevel::parse("trace").is_none());
    }
}
