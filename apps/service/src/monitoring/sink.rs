//! Append-only records produced by dispatches, and the exporter seam for
//! time-series / anomaly-detector feeds.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::types::{HealthState, LogMode, MonitoredItem, ResultMap};

/// Category tags for event log entries
pub const CATEGORY_POLLING: &str = "polling";
pub const CATEGORY_SYSTEM: &str = "system";

/// Immutable record of a state transition or engine anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub time: DateTime<Utc>,
    pub category: String,
    /// State name after the transition, or a severity for system entries.
    pub level: String,
    pub subject_id: Uuid,
    pub subject_name: String,
    pub message: String,
}

impl EventLogEntry {
    pub fn new(
        category: &str,
        level: impl Into<String>,
        subject_id: Uuid,
        subject_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            time: Utc::now(),
            category: category.to_string(),
            level: level.into(),
            subject_id,
            subject_name: subject_name.into(),
            message: message.into(),
        }
    }
}

/// Per-item history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub item_id: Uuid,
    pub time: DateTime<Utc>,
    pub state: HealthState,
    pub result: ResultMap,
}

/// Result snapshot handed to exporters after a completed dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub item_id: Uuid,
    pub node_id: Uuid,
    pub name: String,
    pub probe_type: String,
    pub log_mode: LogMode,
    pub time: DateTime<Utc>,
    pub state: HealthState,
    pub result: ResultMap,
}

impl ResultSnapshot {
    pub fn from_item(item: &MonitoredItem, time: DateTime<Utc>) -> Self {
        Self {
            item_id: item.id,
            node_id: item.node_id,
            name: item.name.clone(),
            probe_type: item.probe_type.clone(),
            log_mode: item.log_mode,
            time,
            state: item.state,
            result: item.result.clone(),
        }
    }
}

/// External consumer of result snapshots (time-series DB, anomaly detector)
#[async_trait::async_trait]
pub trait ResultExporter: Send + Sync {
    async fn export(&self, snapshot: &ResultSnapshot) -> Result<()>;
}

/// Appends one JSON document per snapshot to a file
pub struct JsonLinesExporter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }
}

#[async_trait::async_trait]
impl ResultExporter for JsonLinesExporter {
    async fn export(&self, snapshot: &ResultSnapshot) -> Result<()> {
        let mut line = serde_json::to_vec(snapshot)?;
        line.push(b'\n');

        // Concurrent dispatches must not interleave partial lines.
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
