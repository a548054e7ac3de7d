use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reserved result key holding the last configuration, script or probe error.
pub const ERROR_KEY: &str = "error";

/// Severity an item reports while its probe is failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Info,
    Warn,
    #[default]
    Low,
    High,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Info => "info",
            HealthLevel::Warn => "warn",
            HealthLevel::Low => "low",
            HealthLevel::High => "high",
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthLevel {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(HealthLevel::Info),
            "warn" => Ok(HealthLevel::Warn),
            "low" => Ok(HealthLevel::Low),
            "high" => Ok(HealthLevel::High),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// Persisted health state of an item. Only the state machine writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HealthState {
    #[default]
    Unknown,
    Normal,
    /// Recovered from a failing state since the last retest.
    Repaired,
    Failing(HealthLevel),
}

impl HealthState {
    pub fn is_failing(&self) -> bool {
        matches!(self, HealthState::Failing(_))
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => f.write_str("unknown"),
            HealthState::Normal => f.write_str("normal"),
            HealthState::Repaired => f.write_str("repair"),
            HealthState::Failing(level) => level.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised state or level: {0:?}")]
pub struct ParseStateError(pub String);

impl FromStr for HealthState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthState::Unknown),
            "normal" => Ok(HealthState::Normal),
            "repair" => Ok(HealthState::Repaired),
            other => other.parse().map(HealthState::Failing),
        }
    }
}

impl Serialize for HealthState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HealthState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What gets written to the history log and exporter after a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    None,
    Always,
    #[serde(rename = "onchange")]
    OnChange,
    /// Log every run and feed it to the anomaly detector.
    Ai,
}

impl LogMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogMode::None => "none",
            LogMode::Always => "always",
            LogMode::OnChange => "onchange",
            LogMode::Ai => "ai",
        }
    }

    /// Whether a history record is appended for this dispatch.
    pub fn records_history(&self, state_changed: bool) -> bool {
        match self {
            LogMode::None => false,
            LogMode::Always | LogMode::Ai => true,
            LogMode::OnChange => state_changed,
        }
    }

    /// Whether the result snapshot is offered to the exporter.
    pub fn exports(&self) -> bool {
        matches!(self, LogMode::Always | LogMode::Ai)
    }
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogMode {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(LogMode::None),
            "always" => Ok(LogMode::Always),
            "onchange" => Ok(LogMode::OnChange),
            "ai" => Ok(LogMode::Ai),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// Health signal a probe hands back after one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    /// The check could not be completed.
    Indeterminate,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "pass"),
            Outcome::Fail => write!(f, "fail"),
            Outcome::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// A single measurement kept in an item's result map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultValue::Number(n) => write!(f, "{n}"),
            ResultValue::Text(s) => f.write_str(s),
        }
    }
}

/// Probe working memory, persisted across dispatches of the same item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultMap(BTreeMap<String, ResultValue>);

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        self.0.get(key)
    }

    /// Numeric value for `key`. Text values that parse as numbers are accepted.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            ResultValue::Number(n) => Some(*n),
            ResultValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            ResultValue::Text(s) => Some(s),
            ResultValue::Number(_) => None,
        }
    }

    pub fn set_number(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), ResultValue::Number(value));
    }

    pub fn set_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), ResultValue::Text(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<ResultValue> {
        self.0.remove(key)
    }

    pub fn error(&self) -> Option<&str> {
        self.text(ERROR_KEY)
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.set_text(ERROR_KEY, message);
    }

    pub fn clear_error(&mut self) {
        self.0.remove(ERROR_KEY);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResultValue)> {
        self.0.iter()
    }

    /// Compact `key=value` rendering used in event messages.
    pub fn summary(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One scheduled health check against one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItem {
    pub id: Uuid,
    pub node_id: Uuid,
    pub name: String,
    /// Registry key selecting the probe implementation.
    pub probe_type: String,
    pub target: String,
    pub params: String,
    pub mode: String,
    /// Optional pass/fail expression evaluated over the result map.
    pub script: String,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub retry: u32,
    pub level: HealthLevel,
    pub log_mode: LogMode,
    pub enabled: bool,
    pub next_due: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub result: ResultMap,
    pub state: HealthState,
}

impl MonitoredItem {
    /// Create a new item that is due immediately
    pub fn new(node_id: Uuid, name: String, probe_type: String, target: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            name,
            probe_type,
            target,
            params: String::new(),
            mode: String::new(),
            script: String::new(),
            interval_seconds: 60,
            timeout_seconds: 2,
            retry: 1,
            level: HealthLevel::default(),
            log_mode: LogMode::default(),
            enabled: true,
            next_due: Utc::now(),
            last_run: None,
            result: ResultMap::new(),
            state: HealthState::Unknown,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds.max(1) as i64)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds.max(1))
    }

    /// Move `next_due` one interval forward from the later of `now` and the
    /// previous due time.
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        let base = if now > self.next_due { now } else { self.next_due };
        self.next_due = base + self.interval();
    }

    /// Force the item to be picked up by the next tick and forget prior results.
    pub fn reset_for_retest(&mut self, now: DateTime<Utc>) {
        self.next_due = now - Duration::seconds(1);
        self.state = HealthState::Unknown;
        self.result.clear();
    }
}
