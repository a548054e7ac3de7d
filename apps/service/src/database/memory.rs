//! In-process store used by tests and by `run --ephemeral`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::repository::{NodeDirectory, Store, StoreError};
use crate::monitoring::sink::{EventLogEntry, HistoryRecord};
use crate::monitoring::types::MonitoredItem;

#[derive(Debug, Clone)]
struct NodeEntry {
    name: String,
    changed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    items: HashMap<Uuid, MonitoredItem>,
    history: Vec<HistoryRecord>,
    events: Vec<EventLogEntry>,
    nodes: HashMap<Uuid, NodeEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    pub async fn add_node(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.tables
            .write()
            .await
            .nodes
            .insert(id, NodeEntry { name: name.to_string(), changed_at: None });
        id
    }

    pub async fn node_changed_at(&self, node_id: Uuid) -> Option<DateTime<Utc>> {
        self.tables.read().await.nodes.get(&node_id).and_then(|n| n.changed_at)
    }

    /// Every event log entry, oldest first
    pub async fn events(&self) -> Vec<EventLogEntry> {
        self.tables.read().await.events.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_item(&self, id: Uuid) -> Result<Option<MonitoredItem>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.items.get(&id).cloned())
    }

    async fn for_each_item(
        &self,
        visit: &mut (dyn for<'v> FnMut(&'v MonitoredItem) + Send),
    ) -> Result<(), StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        tables.items.values().for_each(|item| visit(item));
        Ok(())
    }

    async fn update_item(&self, item: &MonitoredItem) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let stored = tables.items.get_mut(&item.id).ok_or(StoreError::NotFound(item.id))?;
        stored.next_due = item.next_due;
        stored.last_run = item.last_run;
        stored.result = item.result.clone();
        stored.state = item.state;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        next_due: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let stored = tables.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        stored.next_due = next_due;
        stored.last_run = last_run;
        Ok(())
    }

    async fn save_item(&self, item: &MonitoredItem) -> Result<(), StoreError> {
        self.check()?;
        self.tables.write().await.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn delete_item(&self, id: Uuid) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.items.remove(&id).ok_or(StoreError::NotFound(id))?;
        tables.history.retain(|r| r.item_id != id);
        Ok(())
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        self.check()?;
        self.tables.write().await.history.push(record.clone());
        Ok(())
    }

    async fn history(&self, item_id: Uuid, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .rev()
            .filter(|r| r.item_id == item_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_event_log(&self, entry: &EventLogEntry) -> Result<(), StoreError> {
        self.check()?;
        self.tables.write().await.events.push(entry.clone());
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventLogEntry>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.events.iter().rev().take(limit).cloned().collect())
    }

    async fn purge_before(
        &self,
        history_cutoff: DateTime<Utc>,
        event_cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let before = tables.history.len() + tables.events.len();
        tables.history.retain(|r| r.time >= history_cutoff);
        tables.events.retain(|e| e.time >= event_cutoff);
        Ok(before - tables.history.len() - tables.events.len())
    }
}

#[async_trait]
impl NodeDirectory for MemoryStore {
    async fn node_name(&self, node_id: Uuid) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.nodes.get(&node_id).map(|n| n.name.clone()))
    }

    async fn mark_changed(&self, node_id: Uuid) -> Result<(), StoreError> {
        self.check()?;
        if let Some(node) = self.tables.write().await.nodes.get_mut(&node_id) {
            node.changed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::{HealthState, ResultMap};

    #[tokio::test]
    async fn test_delete_cascades_history() {
        let store = MemoryStore::new();
        let node = store.add_node("router").await;
        let item = MonitoredItem::new(node, "ping".into(), "tcp".into(), "r:23".into());
        store.save_item(&item).await.unwrap();
        store
            .append_history(&HistoryRecord {
                item_id: item.id,
                time: Utc::now(),
                state: HealthState::Normal,
                result: ResultMap::new(),
            })
            .await
            .unwrap();

        store.delete_item(item.id).await.unwrap();
        assert!(store.history(item.id, 10).await.unwrap().is_empty());
        assert!(matches!(store.delete_item(item.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get_item(Uuid::new_v4()).await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.get_item(Uuid::new_v4()).await.unwrap().is_none());
    }
}
