use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::{DispatchExecutor, DispatchReport};
use super::types::{HealthState, MonitoredItem};
use crate::database::{Store, StoreError};

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the tick timer.
    pub tick_period: Duration,
    /// Items due within this window after "now" are dispatched in the current tick.
    pub lookahead: Duration,
    /// Delay between successive launches within one tick.
    pub stagger: Duration,
    /// How long in-flight dispatches may keep running after shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(30),
            lookahead: Duration::from_secs(30),
            stagger: Duration::from_millis(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Ids of items with a dispatch in flight
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlight {
    /// Claim `id`; `None` when a dispatch for it is already running
    pub fn try_acquire(&self, id: Uuid) -> Option<DispatchGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id).then(|| DispatchGuard { id, ids: self.ids.clone() })
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the in-flight claim when dropped, including on panic
#[derive(Debug)]
pub struct DispatchGuard {
    id: Uuid,
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}

/// Resolves once shutdown is signalled, or the scheduler is gone
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// What a single tick did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Launched items in launch order.
    pub dispatched: Vec<Uuid>,
    /// Due items left alone because their previous dispatch is still running.
    pub skipped: Vec<Uuid>,
}

/// Monitoring scheduler - picks due items each tick and launches their dispatches
pub struct MonitoringScheduler {
    store: Arc<dyn Store>,
    executor: Arc<DispatchExecutor>,
    config: SchedulerConfig,
    in_flight: InFlight,
    tracker: TaskTracker,
    wake: Notify,
    shutdown_tx: watch::Sender<bool>,
    report_tx: Option<mpsc::Sender<DispatchReport>>,
}

impl MonitoringScheduler {
    /// Create a new monitoring scheduler
    pub fn new(store: Arc<dyn Store>, executor: Arc<DispatchExecutor>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            executor,
            config,
            in_flight: InFlight::default(),
            tracker: TaskTracker::new(),
            wake: Notify::new(),
            shutdown_tx,
            report_tx: None,
        }
    }

    /// Forward every completed dispatch report to `tx`
    pub fn with_reports(mut self, tx: mpsc::Sender<DispatchReport>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Tick at the current time
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Select the items due by `now + lookahead`, earliest first, re-arm and
    /// launch each one. Each item is reloaded once claimed, so the dispatch
    /// starts from the latest state and result. Never fails; store errors only
    /// shrink what gets done.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        if self.is_shutting_down() {
            return report;
        }

        let horizon = now + chrono::Duration::from_std(self.config.lookahead).unwrap_or_default();
        let mut due: Vec<MonitoredItem> = Vec::new();
        let mut visit = |item: &MonitoredItem| {
            if item.enabled && item.next_due <= horizon {
                due.push(item.clone());
            }
        };
        if let Err(e) = self.store.for_each_item(&mut visit).await {
            warn!("Tick skipped, could not enumerate items: {}", e);
            return report;
        }
        due.sort_by_key(|item| item.next_due);

        for candidate in due {
            let Some(guard) = self.in_flight.try_acquire(candidate.id) else {
                debug!("Item {} still in flight, not dispatching", candidate.id);
                report.skipped.push(candidate.id);
                continue;
            };

            // The snapshot predates the claim; a dispatch may have finished since.
            let mut item = match self.store.get_item(candidate.id).await {
                Ok(Some(item)) if item.enabled && item.next_due <= horizon => item,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Could not reload {} before dispatch: {}", candidate.id, e);
                    continue;
                }
            };

            item.rearm(now);
            item.last_run = Some(now);
            if let Err(e) = self.store.reschedule(item.id, item.next_due, item.last_run).await {
                warn!("Could not persist re-armed due time for {}: {}", item.id, e);
            }

            let delay = self.config.stagger * report.dispatched.len() as u32;
            report.dispatched.push(item.id);
            self.launch(item, guard, delay);
        }

        if !report.dispatched.is_empty() || !report.skipped.is_empty() {
            debug!(
                "Tick dispatched {} item(s), skipped {} in flight",
                report.dispatched.len(),
                report.skipped.len()
            );
        }
        report
    }

    fn launch(&self, item: MonitoredItem, guard: DispatchGuard, delay: Duration) {
        let executor = self.executor.clone();
        let report_tx = self.report_tx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        self.tracker.spawn(async move {
            let _guard = guard;
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped(&mut shutdown) => {}
                }
            }
            if *shutdown.borrow() {
                debug!("Shutdown requested, dropping pending dispatch of {}", item.id);
                return;
            }

            let report = executor.dispatch(item).await;
            if let Some(tx) = report_tx {
                // The receiver going away only means nobody is listening.
                let _ = tx.send(report).await;
            }
        });
    }

    /// Force one item to be re-checked on the next tick and wake the loop
    pub async fn retest_item(&self, id: Uuid) -> Result<(), StoreError> {
        let mut item = self.store.get_item(id).await?.ok_or(StoreError::NotFound(id))?;
        item.reset_for_retest(Utc::now());
        self.store.update_item(&item).await?;
        info!("Retest requested for {} ({})", item.name, item.id);
        self.wake.notify_one();
        Ok(())
    }

    /// Reset every item that is not `normal` and wake the loop.
    /// Returns how many items were reset.
    pub async fn retest_all(&self) -> Result<usize, StoreError> {
        let mut pending: Vec<MonitoredItem> = Vec::new();
        let mut visit = |item: &MonitoredItem| {
            if item.state != HealthState::Normal {
                pending.push(item.clone());
            }
        };
        self.store.for_each_item(&mut visit).await?;

        let now = Utc::now();
        let mut reset = 0;
        for mut item in pending {
            item.reset_for_retest(now);
            match self.store.update_item(&item).await {
                Ok(()) => reset += 1,
                Err(e) => warn!("Retest of {} not recorded: {}", item.id, e),
            }
        }

        info!("Retest all: {} item(s) reset", reset);
        self.wake.notify_one();
        Ok(reset)
    }

    /// Stop launching dispatches. `run` returns once in-flight work drains.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Tick on the timer or when woken by a retest, until shutdown
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut timer = interval(self.config.tick_period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Scheduler running (tick {:?}, lookahead {:?}, stagger {:?})",
            self.config.tick_period, self.config.lookahead, self.config.stagger
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = self.wake.notified() => debug!("Scheduler woken for retest"),
                _ = stopped(&mut shutdown) => break,
            }
            self.tick().await;
        }

        self.drain().await;
    }

    /// Wait for in-flight dispatches, up to the configured grace period
    pub async fn drain(&self) {
        self.tracker.close();
        info!("Scheduler stopping, waiting for {} in-flight dispatch(es)", self.in_flight.len());
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} dispatch(es) still running after {:?}, abandoning them",
                self.in_flight.len(),
                self.config.shutdown_grace
            );
        }
    }
}
