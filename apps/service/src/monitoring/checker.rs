use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

use super::script::ScriptEngine;
use super::types::{MonitoredItem, Outcome, ResultMap};
use super::validation::{validate_http_target, validate_tcp_target};

/// Protocol-specific checker invoked once per dispatch.
///
/// `result` starts out as the item's map from the previous run; probes merge
/// their measurements into it. The item itself is read-only so a probe can
/// only report an outcome, never set the health state.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, item: &MonitoredItem, result: &mut ResultMap) -> Outcome;
}

/// Probe implementations keyed by item type tag
#[derive(Default, Clone)]
pub struct ProbeRegistry {
    probes: HashMap<String, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `http`, `https` and `tcp` probes
    pub fn with_builtin(script: Arc<dyn ScriptEngine>) -> Result<Self> {
        let mut registry = Self::new();
        let http: Arc<dyn Probe> = Arc::new(HttpProbe::new(script.clone())?);
        registry.register("http", http.clone());
        registry.register("https", http);
        registry.register("tcp", Arc::new(TcpProbe::new(script)));
        Ok(registry)
    }

    /// Register (or replace) the probe for `type_tag`
    pub fn register(&mut self, type_tag: impl Into<String>, probe: Arc<dyn Probe>) {
        self.probes.insert(type_tag.into(), probe);
    }

    pub fn probe_for(&self, type_tag: &str) -> Option<Arc<dyn Probe>> {
        self.probes.get(type_tag).cloned()
    }

    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.probes.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

/// Let the item's script decide the outcome when one is configured.
/// A script error is reported as indeterminate with the text in `error`.
/// Only called once the target answered; a failed request is a plain fail.
pub fn apply_script(engine: &dyn ScriptEngine, item: &MonitoredItem, result: &mut ResultMap, default: Outcome) -> Outcome {
    if item.script.trim().is_empty() {
        return default;
    }
    match engine.evaluate(&item.script, result) {
        Ok(true) => {
            result.clear_error();
            Outcome::Pass
        }
        Ok(false) => Outcome::Fail,
        Err(e) => {
            result.set_error(format!("script: {e}"));
            Outcome::Indeterminate
        }
    }
}

/// Run `attempt` up to `retry + 1` times, returning the first success or the
/// last error.
async fn with_retries<T, F, Fut>(retry: u32, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = anyhow!("no attempt made");
    for n in 0..=retry {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("Attempt {} of {} failed: {}", n + 1, retry + 1, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// HTTP/HTTPS GET probe
pub struct HttpProbe {
    client: reqwest::Client,
    script: Arc<dyn ScriptEngine>,
}

impl HttpProbe {
    pub fn new(script: Arc<dyn ScriptEngine>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("netwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, script })
    }
}

#[async_trait::async_trait]
impl Probe for HttpProbe {
    async fn check(&self, item: &MonitoredItem, result: &mut ResultMap) -> Outcome {
        let url = match validate_http_target(&item.target) {
            Ok(url) => url,
            Err(e) => {
                result.set_error(e.to_string());
                return Outcome::Indeterminate;
            }
        };
        let per_attempt = item.timeout();

        let response = with_retries(item.retry, || {
            let request = self.client.get(url.clone()).timeout(per_attempt);
            async move {
                let start = Instant::now();
                let response = request.send().await.map_err(|e| anyhow!("HTTP request failed: {}", e))?;
                Ok((start.elapsed(), response))
            }
        })
        .await;

        let (latency, response) = match response {
            Ok(answered) => answered,
            Err(e) => {
                for key in ["rtt", "code", "size"] {
                    result.remove(key);
                }
                result.set_error(e.to_string());
                return Outcome::Fail;
            }
        };

        let status = response.status();
        result.set_number("rtt", latency.as_secs_f64() * 1000.0);
        result.set_text("code", status.as_u16().to_string());
        match response.content_length() {
            Some(size) => result.set_number("size", size as f64),
            None => {
                result.remove("size");
            }
        }

        // 2xx and 3xx count as success
        let outcome = if status.is_success() || status.is_redirection() {
            result.clear_error();
            Outcome::Pass
        } else {
            result.set_error(format!("HTTP status {}", status.as_u16()));
            Outcome::Fail
        };

        apply_script(self.script.as_ref(), item, result, outcome)
    }
}

/// TCP port connect probe
pub struct TcpProbe {
    script: Arc<dyn ScriptEngine>,
}

impl TcpProbe {
    pub fn new(script: Arc<dyn ScriptEngine>) -> Self {
        Self { script }
    }

    async fn connect_once(target: &str, limit: Duration) -> Result<Duration> {
        let start = Instant::now();
        timeout(limit, tokio::net::TcpStream::connect(target))
            .await
            .map_err(|_| anyhow!("TCP connection timeout"))?
            .map_err(|e| anyhow!("TCP connection failed: {}", e))?;
        Ok(start.elapsed())
    }
}

#[async_trait::async_trait]
impl Probe for TcpProbe {
    async fn check(&self, item: &MonitoredItem, result: &mut ResultMap) -> Outcome {
        if let Err(e) = validate_tcp_target(&item.target) {
            result.set_error(e.to_string());
            return Outcome::Indeterminate;
        }
        let limit = item.timeout();

        match with_retries(item.retry, || Self::connect_once(&item.target, limit)).await {
            Ok(latency) => {
                result.set_number("rtt", latency.as_secs_f64() * 1000.0);
                result.clear_error();
                apply_script(self.script.as_ref(), item, result, Outcome::Pass)
            }
            Err(e) => {
                result.remove("rtt");
                result.set_error(e.to_string());
                Outcome::Fail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::script::ExprEngine;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn tcp_item(target: String) -> MonitoredItem {
        let mut item = MonitoredItem::new(Uuid::new_v4(), "port".into(), "tcp".into(), target);
        item.retry = 0;
        item
    }

    #[tokio::test]
    async fn test_tcp_probe_pass() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let probe = TcpProbe::new(Arc::new(ExprEngine));
        let mut result = ResultMap::new();
        let outcome = probe.check(&tcp_item(addr.to_string()), &mut result).await;

        assert_eq!(outcome, Outcome::Pass);
        assert!(result.number("rtt").is_some());
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused_is_fail() {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let probe = TcpProbe::new(Arc::new(ExprEngine));
        let mut item = tcp_item(addr.to_string());
        item.retry = 2;
        let mut result = ResultMap::new();
        result.set_number("rtt", 3.0);

        assert_eq!(probe.check(&item, &mut result).await, Outcome::Fail);
        assert!(result.error().unwrap().contains("TCP connection"));
        assert!(result.number("rtt").is_none());
    }

    #[tokio::test]
    async fn test_bad_target_is_indeterminate() {
        let probe = TcpProbe::new(Arc::new(ExprEngine));
        let mut result = ResultMap::new();
        let outcome = probe.check(&tcp_item("no-port".into()), &mut result).await;
        assert_eq!(outcome, Outcome::Indeterminate);
        assert!(result.error().is_some());

        let http = HttpProbe::new(Arc::new(ExprEngine)).unwrap();
        let mut item = tcp_item("ftp://example.com".into());
        item.probe_type = "http".into();
        assert_eq!(http.check(&item, &mut result).await, Outcome::Indeterminate);
    }

    #[tokio::test]
    async fn test_script_decides_outcome() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });

        let probe = TcpProbe::new(Arc::new(ExprEngine));
        let mut item = tcp_item(addr.to_string());

        item.script = "rtt < 0".into();
        let mut result = ResultMap::new();
        assert_eq!(probe.check(&item, &mut result).await, Outcome::Fail);

        item.script = "jitter < 5".into();
        assert_eq!(probe.check(&item, &mut result).await, Outcome::Indeterminate);
        assert!(result.error().unwrap().starts_with("script:"));
    }

    #[tokio::test]
    async fn test_http_unreachable_ignores_previous_result() {
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let probe = HttpProbe::new(Arc::new(ExprEngine)).unwrap();
        let mut item = tcp_item(format!("http://{addr}/health"));
        item.probe_type = "http".into();
        item.script = "code == 200".into();

        let mut result = ResultMap::new();
        result.set_text("code", "200");
        result.set_number("size", 512.0);
        result.set_number("rtt", 4.0);

        assert_eq!(probe.check(&item, &mut result).await, Outcome::Fail);
        assert!(result.text("code").is_none());
        assert!(result.number("size").is_none());
        assert!(result.number("rtt").is_none());
        assert!(result.error().unwrap().contains("HTTP request failed"));
    }

    #[test]
    fn test_script_pass_clears_error() {
        let item = MonitoredItem { script: "code == 503".into(), ..tcp_item("h:1".into()) };
        let mut result = ResultMap::new();
        result.set_text("code", "503");
        result.set_error("HTTP status 503");

        assert_eq!(apply_script(&ExprEngine, &item, &mut result, Outcome::Fail), Outcome::Pass);
        assert!(result.error().is_none());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProbeRegistry::with_builtin(Arc::new(ExprEngine)).unwrap();
        assert_eq!(registry.type_tags(), vec!["http", "https", "tcp"]);
        assert!(registry.probe_for("tcp").is_some());
        assert!(registry.probe_for("gnmi").is_none());
    }
}
