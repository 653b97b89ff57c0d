/// Audit logging for mutating operations
///
/// Every apply, set update, ban and cleanup issued from the CLI is appended
/// to `audit.log` in the state directory as one JSON object per line.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("State directory not found")]
    NoStateDir,

    #[error("Audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit event not serializable: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Apply,
    Cleanup,
    UpdateSet,
    Ban,
    Unban,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,

    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Table, set, element counts and similar
    pub details: serde_json::Value,

    /// Error message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Log in the state directory, created if needed
    pub fn new() -> Result<Self, AuditError> {
        let mut log_path = crate::utils::ensure_state_dir().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AuditError::NoStateDir
            } else {
                AuditError::Io(e)
            }
        })?;
        log_path.push("audit.log");
        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line.
    pub fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(event)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    /// Most recent `count` events, newest first. Unparseable lines are skipped.
    pub fn read_recent(&self, count: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let content = std::fs::read_to_string(&self.log_path)?;
        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

/// Records an event in the default log; failures are only warned about.
pub fn record(event_type: EventType, details: serde_json::Value, result: Result<(), String>) {
    let event = AuditEvent::new(event_type, result.is_ok(), details, result.err());
    match AuditLog::new() {
        Ok(audit) => {
            if let Err(e) = audit.log(&event) {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
        Err(e) => tracing::debug!("Audit log unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(EventType::UpdateSet, true, json!({ "set": "trusted" }), None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"update_set\""));
        assert!(json.contains("\"success\":true"));

        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.event_type, EventType::UpdateSet);
    }

    #[test]
    fn test_log_appends_lines() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::at(dir.path().join("audit.log"));

        log.log(&AuditEvent::new(EventType::Apply, true, json!({}), None))
            .unwrap();
        log.log(&AuditEvent::new(
            EventType::Ban,
            false,
            json!({ "count": 2 }),
            Some("nft failed".to_string()),
        ))
        .unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 2);

        let recent = log.read_recent(5).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, EventType::Ban);
        assert_eq!(recent[0].error.as_deref(), Some("nft failed"));
        assert_eq!(recent[1].event_type, EventType::Apply);
    }

    #[test]
    fn test_read_recent_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, "not json\n").unwrap();
        let log = AuditLog::at(&path);
        log.log(&AuditEvent::new(EventType::Cleanup, true, json!({}), None))
            .unwrap();

        let recent = log.read_recent(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, EventType::Cleanup);
    }
}
