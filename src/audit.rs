/// Audit logging for kernel-mutating operations
///
/// Every bootstrap and every sync step that committed something is recorded,
/// as are failed passes. Failures to write the log never fail the operation.
use crate::core::model::ZoneName;
use crate::core::sync::SyncOutcome;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Bootstrap,
    SyncInterfaces,
    ReplacePolicy,
    SyncPrefixes,
    ReconcileFailed,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Region the operation ran against
    pub region: String,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        region: &str,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            region: region.to_string(),
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the XDG state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let dir = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        Ok(Self::in_dir(&dir))
    }

    /// Audit log stored as `audit.log` in `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            log_path: dir.join("audit.log"),
        }
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Logs a bootstrap (table reset and topology install)
pub async fn log_bootstrap(
    audit: &AuditLog,
    region: &str,
    mutations: usize,
    success: bool,
    error: Option<String>,
) {
    let event = AuditEvent::new(
        EventType::Bootstrap,
        region,
        success,
        serde_json::json!({ "mutations": mutations }),
        error,
    );
    audit.record(event).await;
}

/// Logs one event per sync step of `outcome` that committed changes
pub async fn log_sync(audit: &AuditLog, region: &str, zone: ZoneName, outcome: &SyncOutcome) {
    let observed = &outcome.observed;
    let steps = [
        (
            EventType::SyncInterfaces,
            outcome.changes.interfaces,
            serde_json::json!(observed.interfaces),
        ),
        (
            EventType::ReplacePolicy,
            outcome.changes.policy,
            serde_json::json!(observed.policy),
        ),
        (
            EventType::SyncPrefixes,
            outcome.changes.prefixes,
            serde_json::json!(observed.addresses),
        ),
    ];
    for (event_type, mutations, state) in steps {
        if mutations == 0 {
            continue;
        }
        let event = AuditEvent::new(
            event_type,
            region,
            true,
            serde_json::json!({
                "zone": zone,
                "mutations": mutations,
                "observed": state,
                "rejected": outcome.rejected,
            }),
            None,
        );
        audit.record(event).await;
    }
}

/// Logs a pass that stopped on an error
pub async fn log_failure(audit: &AuditLog, region: &str, retryable: bool, error: String) {
    let event = AuditEvent::new(
        EventType::ReconcileFailed,
        region,
        false,
        serde_json::json!({ "retryable": retryable }),
        Some(error),
    );
    audit.record(event).await;
}
