use crate::errors::TyperError;
use crate::log_retention::{enforce_total_budget, rotated_path};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub max_file_bytes: u64,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            max_file_bytes: 1024 * 1024,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn from_config(cfg: &crate::config::LoggingConfig) -> Self {
        Self {
            path: cfg.path.clone(),
            max_payload_bytes: cfg.max_payload_bytes,
            max_file_bytes: cfg.max_file_bytes,
            budget_bytes: cfg.budget_bytes,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), TyperError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TyperError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| TyperError::Io(e.to_string()))?;

        let current_len = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        if current_len > 0 && current_len + line.len() as u64 + 1 > self.max_file_bytes {
            fs::rename(&self.path, rotated_path(&self.path))
                .map_err(|e| TyperError::Io(e.to_string()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TyperError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| TyperError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| TyperError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            let _ = enforce_total_budget(parent, self.budget_bytes, &self.path)?;
        }

        Ok(())
    }
}

// ── Run logger ────────────────────────────────────────────────────────────────

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

pub fn init_run_logger(logger: JsonlLogger) {
    *logger_slot().lock().expect("run logger init lock") = Some(logger);
}

pub fn clear_run_logger() {
    *logger_slot().lock().expect("run logger clear lock") = None;
}

/// Appends one event to the run log. No-op until `init_run_logger`.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = logger_slot().lock().expect("run logger lock").clone();
    if let Some(logger) = logger {
        let event = LogEvent {
            level,
            event_type,
            payload,
        };
        if logger.append(&event).is_err() {
            eprintln!("{}", structured_fallback_line(level, event_type, &event.payload));
        }
    }
}

pub fn structured_fallback_line(level: &str, event_type: &str, payload: &Value) -> String {
    format!(
        "level={level} event={event_type} payload={} ",
        payload.to_string().replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
