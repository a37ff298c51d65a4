//! Audit logging (§4.6/§6): append-only JSON-lines event log with byte-threshold rotation.
//! Grounded on `api/audit.py`; rotation is hand-rolled rather than delegated to
//! `tracing-appender` (which only rotates on time, not size) because §6 requires a byte
//! threshold plus a numbered backup count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Closed action enum (§6), ported from `AuditAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AuthLoginSuccess,
    AuthLoginFailure,
    ApiKeyCreated,
    ApiKeyRevoked,
    ChatRequest,
    ChatStreamStart,
    ChatStreamEnd,
    SkillAccessed,
    SkillDenied,
    ToolCalled,
    ToolFailed,
    RateLimitExceeded,
    ServerStart,
    ServerStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// §3 AuditEvent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, severity: AuditSeverity, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            severity,
            user_id: None,
            username: None,
            auth_type: None,
            client_ip: None,
            request_id: None,
            method: None,
            path: None,
            resource: None,
            resource_id: None,
            details: None,
            success,
            error_message: None,
            duration_ms: None,
        }
    }
}

struct RotatingWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: u32,
    file: File,
    current_size: u64,
}

impl RotatingWriter {
    fn open(path: &Path, max_bytes: u64, backups: u32) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backups,
            file,
            current_size,
        })
    }

    fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        if self.current_size + line.len() as u64 + 1 > self.max_bytes && self.current_size > 0 {
            self.rotate()?;
        }
        writeln!(self.file, "{line}")?;
        self.current_size += line.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&mut self) -> anyhow::Result<()> {
        for i in (1..self.backups).rev() {
            let src = self.backup_path(i);
            let dst = self.backup_path(i + 1);
            if src.exists() {
                let _ = std::fs::rename(&src, &dst);
            }
        }
        if self.backups > 0 {
            let dst = self.backup_path(1);
            let _ = std::fs::rename(&self.path, &dst);
        } else {
            std::fs::remove_file(&self.path).ok();
        }
        self.file = OpenOptions::new().create(true).append(true).truncate(false).open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

/// Append-only audit sink plus a tail (stderr, warning+) for operator visibility, matching the
/// teacher's split stdout/file logging layers in spirit.
pub struct AuditLogger {
    writer: Mutex<RotatingWriter>,
    console_min_severity: AuditSeverity,
}

impl AuditLogger {
    pub fn new(log_dir: &str, max_file_mb: u64, backups: u32) -> anyhow::Result<Self> {
        let dir = crate::logging::expand_path(log_dir);
        let path = dir.join("audit.log");
        let writer = RotatingWriter::open(&path, max_file_mb * 1024 * 1024, backups)?;
        Ok(Self {
            writer: Mutex::new(writer),
            console_min_severity: AuditSeverity::Warning,
        })
    }

    pub fn log(&self, event: &AuditEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if event.severity >= self.console_min_severity {
            eprintln!("{line}");
        }
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writer.write_line(&line) {
                tracing::error!(error = %e, "failed to write audit log entry");
            }
        }
    }

    pub fn log_action(&self, action: AuditAction, severity: AuditSeverity, success: bool, username: Option<&str>) {
        let mut event = AuditEvent::new(action, severity, success);
        event.username = username.map(String::from);
        self.log(&event);
    }

    /// Reads recent events off the current log file in reverse chronological order, applying
    /// optional filters, matching `AuditLogger.get_recent_events`'s read-last-2N-lines
    /// heuristic and tolerant parse-skip behavior.
    pub fn recent(
        &self,
        limit: usize,
        action: Option<AuditAction>,
        user_id: Option<&str>,
        success: Option<bool>,
    ) -> Vec<AuditEvent> {
        let path = self.writer.lock().map(|w| w.path.clone()).unwrap_or_default();
        let Ok(file) = File::open(&path) else {
            return Vec::new();
        };
        let lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
        let scan_from = lines.len().saturating_sub(limit * 2);
        let mut results = Vec::with_capacity(limit);
        for line in lines[scan_from..].iter().rev() {
            let Ok(event) = serde_json::from_str::<AuditEvent>(line) else {
                continue;
            };
            if let Some(a) = action {
                if event.action != a {
                    continue;
                }
            }
            if let Some(uid) = user_id {
                if event.user_id.as_deref() != Some(uid) {
                    continue;
                }
            }
            if let Some(s) = success {
                if event.success != s {
                    continue;
                }
            }
            results.push(event);
            if results.len() >= limit {
                break;
            }
        }
        results
    }
}

/// Wraps a fallible async action with timing + success/failure audit logging, mirroring the
/// `audited()` decorator's async path.
pub async fn audited<F, Fut, T, E>(logger: &AuditLogger, action: AuditAction, resource: Option<&str>, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = std::time::Instant::now();
    let result = f().await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mut event = AuditEvent::new(action, AuditSeverity::Info, result.is_ok());
    event.resource = resource.map(String::from);
    event.duration_ms = Some(duration_ms);
    if let Err(e) = &result {
        event.severity = AuditSeverity::Error;
        event.error_message = Some(e.to_string());
    }
    logger.log(&event);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_free_dir as test_dir;

    mod tempfile_free_dir {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub fn unique(prefix: &str) -> PathBuf {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            std::env::temp_dir().join(format!("{prefix}-{}-{n}", std::process::id()))
        }
    }

    #[test]
    fn rotates_after_exceeding_byte_threshold() {
        let dir = test_dir::unique("audit-rotate");
        let logger = AuditLogger::new(dir.to_str().unwrap(), 0, 2).unwrap();
        // max_file_mb=0 forces rotation on the second write given any non-empty first line.
        let writer_max_bytes = 200;
        {
            let mut w = logger.writer.lock().unwrap();
            w.max_bytes = writer_max_bytes;
        }
        for i in 0..20 {
            logger.log_action(AuditAction::ChatRequest, AuditSeverity::Info, true, Some(&format!("user{i}")));
        }
        let backup1 = dir.join("audit.log.1");
        assert!(backup1.exists(), "expected rotation to produce a .1 backup file");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn recent_filters_by_action_and_success() {
        let dir = test_dir::unique("audit-recent");
        let logger = AuditLogger::new(dir.to_str().unwrap(), 100, 5).unwrap();
        logger.log_action(AuditAction::ChatRequest, AuditSeverity::Info, true, Some("alice"));
        logger.log_action(AuditAction::AuthLoginFailure, AuditSeverity::Warning, false, Some("bob"));
        logger.log_action(AuditAction::ChatRequest, AuditSeverity::Info, false, Some("alice"));

        let chats = logger.recent(10, Some(AuditAction::ChatRequest), None, None);
        assert_eq!(chats.len(), 2);

        let alice_failures = logger.recent(10, None, Some("alice"), Some(false));
        assert_eq!(alice_failures.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
