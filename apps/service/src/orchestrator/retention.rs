//! Automatic retention of item history and the event log.
//!
//! Records older than their configured age are purged periodically as a
//! background task. Items themselves are never purged.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::database::Store;

/// Retention policy for history and events
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Days to keep item history
    pub history_days: i64,
    /// Days to keep event log entries
    pub event_log_days: i64,
    /// How often the cleanup runs
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { history_days: 30, event_log_days: 90, interval: Duration::from_secs(3600) }
    }
}

impl RetentionPolicy {
    fn history_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(self.history_days)
    }

    fn event_log_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(self.event_log_days)
    }
}

/// Cleanup manager for expired records
pub struct RetentionCleanup {
    store: Arc<dyn Store>,
    policy: RetentionPolicy,
}

impl RetentionCleanup {
    pub fn new(store: Arc<dyn Store>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    /// Purge history and events past their retention age as of `now`.
    /// Returns the number of records deleted.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let history_cutoff = self.policy.history_cutoff(now);
        let event_cutoff = self.policy.event_log_cutoff(now);
        debug!(
            "Retention cleanup: history before {}, events before {}",
            history_cutoff, event_cutoff
        );

        let deleted = self.store.purge_before(history_cutoff, event_cutoff).await?;
        info!("Retention cleanup completed: {} records deleted", deleted);
        Ok(deleted)
    }

    /// Start background cleanup task, stopping when `shutdown` turns true
    pub fn start_periodic_cleanup(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                if let Err(e) = self.cleanup_at(Utc::now()).await {
                    warn!("Periodic retention cleanup failed: {}", e);
                }
            }
            debug!("Retention cleanup stopped");
        })
    }
}
