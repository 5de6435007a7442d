use anyhow::{Context, Result};
use chrono::Utc;
use nfe_core::SaleStatus;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// One line of the JSONL audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub sale_id: Uuid,
    pub status: SaleStatus,
    pub access_key: Option<String>,
    pub protocol_number: Option<String>,
    pub error: Option<String>,
    pub document_hash: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, sale_id: Uuid, status: SaleStatus) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            sale_id,
            status,
            access_key: None,
            protocol_number: None,
            error: None,
            document_hash: None,
        }
    }

    pub fn with_access_key(mut self, access_key: Option<&str>) -> Self {
        self.access_key = access_key.map(str::to_string);
        self
    }

    pub fn with_protocol_number(mut self, protocol_number: Option<&str>) -> Self {
        self.protocol_number = protocol_number.map(str::to_string);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_hash(mut self, hash: String) -> Self {
        self.document_hash = Some(hash);
        self
    }
}

/// Appends audit events to a file. Without a path, events are only traced.
pub struct AuditLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn write(&self, event: &AuditEvent) -> Result<()> {
        tracing::debug!(
            event_type = %event.event_type,
            sale_id = %event.sale_id,
            status = %event.status,
            "audit event"
        );
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string(event)?;
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("audit lock poisoned"))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Like `write`, but a failure is logged instead of returned.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(&event) {
            tracing::warn!(error = %e, event_type = %event.event_type, "audit write failed");
        }
    }
}
