use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::monitoring::sink::{EventLogEntry, HistoryRecord};
use crate::monitoring::types::{MonitoredItem, ResultMap};
use crate::pool::{LibsqlManager, LibsqlPool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database query failed: {0}")]
    Query(#[from] libsql::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Item not found: {0}")]
    NotFound(Uuid),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl From<uuid::Error> for StoreError {
    fn from(e: uuid::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Persistence consumed by the polling engine. Every call is atomic on its own,
/// including the cascade in `delete_item`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_item(&self, id: Uuid) -> Result<Option<MonitoredItem>, StoreError>;

    /// Call `visit` once per stored item, in no particular order
    async fn for_each_item(
        &self,
        visit: &mut (dyn for<'v> FnMut(&'v MonitoredItem) + Send),
    ) -> Result<(), StoreError>;

    /// Persist the scheduling fields, result map and state of an existing item.
    /// Configuration fields are left untouched.
    async fn update_item(&self, item: &MonitoredItem) -> Result<(), StoreError>;

    /// Persist only `next_due` and `last_run` of an existing item
    async fn reschedule(
        &self,
        id: Uuid,
        next_due: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Insert a new item, or replace every field of an existing one
    async fn save_item(&self, item: &MonitoredItem) -> Result<(), StoreError>;

    /// Delete an item together with its history
    async fn delete_item(&self, id: Uuid) -> Result<(), StoreError>;

    async fn append_history(&self, record: &HistoryRecord) -> Result<(), StoreError>;

    /// Most recent history records for an item, newest first
    async fn history(&self, item_id: Uuid, limit: usize) -> Result<Vec<HistoryRecord>, StoreError>;

    async fn append_event_log(&self, entry: &EventLogEntry) -> Result<(), StoreError>;

    /// Most recent event log entries, newest first
    async fn recent_events(&self, limit: usize) -> Result<Vec<EventLogEntry>, StoreError>;

    /// Drop history rows older than `history_cutoff` and event log rows older
    /// than `event_cutoff`, returning the count
    async fn purge_before(
        &self,
        history_cutoff: DateTime<Utc>,
        event_cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

/// Owning-node lookups used to enrich events and flag nodes for the UI
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn node_name(&self, node_id: Uuid) -> Result<Option<String>, StoreError>;

    async fn mark_changed(&self, node_id: Uuid) -> Result<(), StoreError>;
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_field<T: std::str::FromStr>(raw: &str, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

const ITEM_COLUMNS: &str = "id, node_id, name, probe_type, target, params, mode, script, interval_seconds, \
     timeout_seconds, retry, level, log_mode, enabled, next_due, last_run, result, state";

fn item_from_row(row: &Row) -> Result<MonitoredItem, StoreError> {
    let id: String = row.get(0)?;
    let node_id: String = row.get(1)?;
    let level: String = row.get(11)?;
    let log_mode: String = row.get(12)?;
    let last_run: Option<i64> = row.get(15)?;
    let result: String = row.get(16)?;
    let state: String = row.get(17)?;

    Ok(MonitoredItem {
        id: Uuid::parse_str(&id)?,
        node_id: Uuid::parse_str(&node_id)?,
        name: row.get(2)?,
        probe_type: row.get(3)?,
        target: row.get(4)?,
        params: row.get(5)?,
        mode: row.get(6)?,
        script: row.get(7)?,
        interval_seconds: row.get::<i64>(8)? as u64,
        timeout_seconds: row.get::<i64>(9)? as u64,
        retry: row.get::<i64>(10)? as u32,
        level: parse_field(&level, "level")?,
        log_mode: parse_field(&log_mode, "log_mode")?,
        enabled: row.get::<i64>(13)? != 0,
        next_due: from_millis(row.get(14)?)?,
        last_run: last_run.map(from_millis).transpose()?,
        result: serde_json::from_str::<ResultMap>(&result)?,
        state: parse_field(&state, "state")?,
    })
}

/// LibSQL-backed store
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>, StoreError> {
        self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Find a node by name, creating it when missing
    pub async fn upsert_node(&self, name: &str) -> Result<Uuid, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT id FROM nodes WHERE name = ?", params![name]).await?;
        if let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            return Ok(Uuid::parse_str(&id)?);
        }

        let id = Uuid::new_v4();
        conn.execute("INSERT INTO nodes (id, name) VALUES (?, ?)", params![id.to_string(), name]).await?;
        Ok(id)
    }

    /// When the node was last flagged as changed
    pub async fn node_changed_at(&self, node_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT changed_at FROM nodes WHERE id = ?", params![node_id.to_string()]).await?;
        match rows.next().await? {
            Some(row) => row.get::<Option<i64>>(0)?.map(from_millis).transpose(),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Store for DatabaseImpl {
    async fn get_item(&self, id: Uuid) -> Result<Option<MonitoredItem>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"), params![id.to_string()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(item_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn for_each_item(
        &self,
        visit: &mut (dyn for<'v> FnMut(&'v MonitoredItem) + Send),
    ) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query(&format!("SELECT {ITEM_COLUMNS} FROM items"), ()).await?;

        while let Some(row) = rows.next().await? {
            match item_from_row(&row) {
                Ok(item) => visit(&item),
                // One bad row must not hide every other item from the scheduler.
                Err(e) => tracing::warn!("Skipping unreadable item row: {}", e),
            }
        }
        Ok(())
    }

    async fn update_item(&self, item: &MonitoredItem) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE items SET next_due = ?, last_run = ?, result = ?, state = ? WHERE id = ?",
                params![
                    to_millis(item.next_due),
                    item.last_run.map(to_millis),
                    serde_json::to_string(&item.result)?,
                    item.state.to_string(),
                    item.id.to_string()
                ],
            )
            .await?;

        if changed == 0 {
            return Err(StoreError::NotFound(item.id));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        next_due: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE items SET next_due = ?, last_run = ? WHERE id = ?",
                params![to_millis(next_due), last_run.map(to_millis), id.to_string()],
            )
            .await?;

        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn save_item(&self, item: &MonitoredItem) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO items ({ITEM_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                item.id.to_string(),
                item.node_id.to_string(),
                item.name.clone(),
                item.probe_type.clone(),
                item.target.clone(),
                item.params.clone(),
                item.mode.clone(),
                item.script.clone(),
                item.interval_seconds as i64,
                item.timeout_seconds as i64,
                item.retry as i64,
                item.level.to_string(),
                item.log_mode.to_string(),
                if item.enabled { 1 } else { 0 },
                to_millis(item.next_due),
                item.last_run.map(to_millis),
                serde_json::to_string(&item.result)?,
                item.state.to_string()
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_item(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        tx.execute("DELETE FROM item_history WHERE item_id = ?", params![id.to_string()]).await?;
        let deleted = tx.execute("DELETE FROM items WHERE id = ?", params![id.to_string()]).await?;
        if deleted == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO item_history (item_id, time, state, result) VALUES (?, ?, ?, ?)",
            params![
                record.item_id.to_string(),
                to_millis(record.time),
                record.state.to_string(),
                serde_json::to_string(&record.result)?
            ],
        )
        .await?;
        Ok(())
    }

    async fn history(&self, item_id: Uuid, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT time, state, result FROM item_history WHERE item_id = ? ORDER BY time DESC, id DESC LIMIT ?",
                params![item_id.to_string(), limit as i64],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let state: String = row.get(1)?;
            let result: String = row.get(2)?;
            records.push(HistoryRecord {
                item_id,
                time: from_millis(row.get(0)?)?,
                state: parse_field(&state, "state")?,
                result: serde_json::from_str(&result)?,
            });
        }
        Ok(records)
    }

    async fn append_event_log(&self, entry: &EventLogEntry) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO event_log (time, category, level, subject_id, subject_name, message) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                to_millis(entry.time),
                entry.category.clone(),
                entry.level.clone(),
                entry.subject_id.to_string(),
                entry.subject_name.clone(),
                entry.message.clone()
            ],
        )
        .await?;
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventLogEntry>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT time, category, level, subject_id, subject_name, message FROM event_log ORDER BY time DESC, id DESC LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let subject_id: String = row.get(3)?;
            entries.push(EventLogEntry {
                time: from_millis(row.get(0)?)?,
                category: row.get(1)?,
                level: row.get(2)?,
                subject_id: Uuid::parse_str(&subject_id)?,
                subject_name: row.get(4)?,
                message: row.get(5)?,
            });
        }
        Ok(entries)
    }

    async fn purge_before(
        &self,
        history_cutoff: DateTime<Utc>,
        event_cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.get_conn().await?;
        let history =
            conn.execute("DELETE FROM item_history WHERE time < ?", params![to_millis(history_cutoff)]).await?;
        let events = conn.execute("DELETE FROM event_log WHERE time < ?", params![to_millis(event_cutoff)]).await?;
        Ok((history + events) as usize)
    }
}

#[async_trait]
impl NodeDirectory for DatabaseImpl {
    async fn node_name(&self, node_id: Uuid) -> Result<Option<String>, StoreError> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT name FROM nodes WHERE id = ?", params![node_id.to_string()]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn mark_changed(&self, node_id: Uuid) -> Result<(), StoreError> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE nodes SET changed_at = ? WHERE id = ?",
            params![to_millis(Utc::now()), node_id.to_string()],
        )
        .await?;
        Ok(())
    }
}
