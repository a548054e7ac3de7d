use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checker::ProbeRegistry;
use super::sink::{CATEGORY_POLLING, CATEGORY_SYSTEM, EventLogEntry, HistoryRecord, ResultExporter, ResultSnapshot};
use super::state::{self, Transition};
use super::types::{MonitoredItem, Outcome};
use crate::database::{NodeDirectory, Store};

/// Extra time granted on top of a probe's own timeout and retry budget.
pub const DEFAULT_BUDGET_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one dispatch, returned for logging and tests
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub item_id: Uuid,
    pub outcome: Outcome,
    pub transition: Option<Transition>,
}

/// Runs a probe against one item and applies everything that follows from it:
/// state transition, event log, history, export, node marking and persistence.
pub struct DispatchExecutor {
    registry: ProbeRegistry,
    store: Arc<dyn Store>,
    nodes: Arc<dyn NodeDirectory>,
    exporter: Option<Arc<dyn ResultExporter>>,
    budget_grace: Duration,
}

impl DispatchExecutor {
    pub fn new(registry: ProbeRegistry, store: Arc<dyn Store>, nodes: Arc<dyn NodeDirectory>) -> Self {
        Self { registry, store, nodes, exporter: None, budget_grace: DEFAULT_BUDGET_GRACE }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn ResultExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_budget_grace(mut self, grace: Duration) -> Self {
        self.budget_grace = grace;
        self
    }

    /// Upper bound on how long a single dispatch of `item` may run
    pub fn time_budget(&self, item: &MonitoredItem) -> Duration {
        item.timeout() * (item.retry + 1) + self.budget_grace
    }

    /// Execute one dispatch. Never fails: probe errors, panics and budget
    /// overruns all end up as an indeterminate outcome.
    pub async fn dispatch(&self, mut item: MonitoredItem) -> DispatchReport {
        let outcome = self.run_probe(&mut item).await;
        let transition = state::apply(&mut item.state, outcome, item.level);

        debug!(
            "Item {} ({}) - outcome {} - state {}",
            item.id, item.name, outcome, item.state
        );

        if let Some(transition) = transition.filter(|t| t.announce) {
            self.announce(&item, transition).await;
        }
        self.record(&item, transition.is_some()).await;

        if let Err(e) = self.store.update_item(&item).await {
            error!("Failed to persist item {} after dispatch: {}", item.id, e);
        }

        DispatchReport { item_id: item.id, outcome, transition }
    }

    async fn run_probe(&self, item: &mut MonitoredItem) -> Outcome {
        let Some(probe) = self.registry.probe_for(&item.probe_type) else {
            warn!("Item {} has unknown probe type {:?}", item.id, item.probe_type);
            item.result.set_error(format!("unknown probe type: {}", item.probe_type));
            return Outcome::Indeterminate;
        };

        let budget = self.time_budget(item);
        let mut result = std::mem::take(&mut item.result);
        let run = AssertUnwindSafe(probe.check(&*item, &mut result)).catch_unwind();
        let outcome = tokio::time::timeout(budget, run).await;

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!("Probe {} panicked on item {}: {}", item.probe_type, item.id, message);
                result.set_error(format!("probe panicked: {message}"));
                self.log_system_event(item, format!("Probe {} crashed: {}", item.probe_type, message))
                    .await;
                Outcome::Indeterminate
            }
            Err(_) => {
                warn!("Probe {} exceeded {:?} on item {}", item.probe_type, budget, item.id);
                result.set_error(format!("probe exceeded its time budget of {}s", budget.as_secs()));
                Outcome::Indeterminate
            }
        };
        item.result = result;
        outcome
    }

    async fn announce(&self, item: &MonitoredItem, transition: Transition) {
        let node_name = self
            .nodes
            .node_name(item.node_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Node lookup failed for {}: {}", item.node_id, e);
                None
            })
            .unwrap_or_default();

        let mut message = format!("{} {}: {} -> {}", item.name, item.probe_type, transition.from, transition.to);
        if let Some(error) = item.result.error() {
            message.push_str(&format!(" ({error})"));
        }
        info!("{} {}", node_name, message);

        let entry = EventLogEntry::new(CATEGORY_POLLING, transition.to.to_string(), item.id, node_name, message);
        if let Err(e) = self.store.append_event_log(&entry).await {
            error!("Failed to append event log for {}: {}", item.id, e);
        }
        if let Err(e) = self.nodes.mark_changed(item.node_id).await {
            warn!("Failed to mark node {} changed: {}", item.node_id, e);
        }
    }

    async fn record(&self, item: &MonitoredItem, state_changed: bool) {
        let now = item.last_run.unwrap_or_else(Utc::now);

        if item.log_mode.records_history(state_changed) {
            let record = HistoryRecord { item_id: item.id, time: now, state: item.state, result: item.result.clone() };
            if let Err(e) = self.store.append_history(&record).await {
                error!("Failed to append history for {}: {}", item.id, e);
            }
        }

        if let Some(exporter) = self.exporter.as_ref().filter(|_| item.log_mode.exports()) {
            if let Err(e) = exporter.export(&ResultSnapshot::from_item(item, now)).await {
                warn!("Result export failed for {}: {}", item.id, e);
            }
        }
    }

    async fn log_system_event(&self, item: &MonitoredItem, message: String) {
        let entry = EventLogEntry::new(CATEGORY_SYSTEM, "error", item.id, item.name.clone(), message);
        if let Err(e) = self.store.append_event_log(&entry).await {
            error!("Failed to append event log for {}: {}", item.id, e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
