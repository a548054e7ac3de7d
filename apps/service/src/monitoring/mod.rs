/// Polling engine - decides when each monitored item is checked and how the
/// outcome turns into a health state
///
/// This module is responsible for:
/// - Scheduling due items and re-arming their next due time
/// - Dispatching each item to the probe registered for its type
/// - Applying state transitions and writing events, history and exports
pub mod checker;
pub mod delta;
pub mod executor;
pub mod scheduler;
pub mod script;
pub mod sink;
pub mod state;
pub mod types;
pub mod validation;


pub use checker::{Probe, ProbeRegistry};
pub use executor::{DispatchExecutor, DispatchReport};
pub use scheduler::{MonitoringScheduler, SchedulerConfig, TickReport};
pub use types::{HealthLevel, HealthState, LogMode, MonitoredItem, Outcome, ResultMap};
