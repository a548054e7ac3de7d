//! Configuration checks for monitored items.
//!
//! Probes call the target validators themselves so a bad target surfaces as an
//! indeterminate outcome with the reason in the result map; the CLI calls
//! [`validate_item`] before an item is stored.

use anyhow::{Result, anyhow};
use url::Url;

use super::types::MonitoredItem;

const MIN_INTERVAL: u64 = 10;
const MAX_INTERVAL: u64 = 86400; // 24 hours
const MIN_TIMEOUT: u64 = 1;
const MAX_TIMEOUT: u64 = 300; // 5 minutes
const MAX_RETRY: u32 = 10;

/// Validate the scheduling fields and, for built-in probe types, the target
pub fn validate_item(item: &MonitoredItem) -> Result<()> {
    if item.name.trim().is_empty() {
        return Err(anyhow!("Item name must not be empty"));
    }
    validate_check_interval(item.interval_seconds)?;
    validate_timeout(item.timeout_seconds)?;
    validate_retry(item.retry)?;
    validate_target(&item.target, &item.probe_type)
}

/// Validates a target based on its probe type. Types without a built-in
/// validator are accepted as-is.
pub fn validate_target(target: &str, probe_type: &str) -> Result<()> {
    match probe_type {
        "http" | "https" => validate_http_target(target).map(|_| ()),
        "tcp" => validate_tcp_target(target).map(|_| ()),
        _ => Ok(()),
    }
}

/// Parse an HTTP/HTTPS target
pub fn validate_http_target(target: &str) -> Result<Url> {
    let url = Url::parse(target).map_err(|e| anyhow!("Invalid URL: {}", e))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("Invalid scheme for HTTP probe: {}", other)),
    }

    if url.host_str().is_none() {
        return Err(anyhow!("URL has no host: {}", target));
    }

    if let Some(port) = url.port() {
        validate_port(port)?;
    }

    Ok(url)
}

/// Split a TCP target into host and port
pub fn validate_tcp_target(target: &str) -> Result<(String, u16)> {
    // rsplit keeps bracketed IPv6 hosts intact: [::1]:22
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("TCP target must be in format host:port"))?;

    if host.is_empty() {
        return Err(anyhow!("TCP target has an empty host"));
    }

    let port: u16 = port.parse().map_err(|_| anyhow!("Invalid port number"))?;
    validate_port(port)?;

    Ok((host.to_string(), port))
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(anyhow!("Port 0 is not valid"));
    }
    Ok(())
}

/// Validate check interval
pub fn validate_check_interval(interval_seconds: u64) -> Result<()> {
    if interval_seconds < MIN_INTERVAL {
        return Err(anyhow!(
            "Check interval too short: {} seconds (minimum: {})",
            interval_seconds,
            MIN_INTERVAL
        ));
    }

    if interval_seconds > MAX_INTERVAL {
        return Err(anyhow!(
            "Check interval too long: {} seconds (maximum: {})",
            interval_seconds,
            MAX_INTERVAL
        ));
    }

    Ok(())
}

/// Validate timeout is reasonable
pub fn validate_timeout(timeout_seconds: u64) -> Result<()> {
    if timeout_seconds < MIN_TIMEOUT {
        return Err(anyhow!(
            "Timeout too short: {} seconds (minimum: {})",
            timeout_seconds,
            MIN_TIMEOUT
        ));
    }

    if timeout_seconds > MAX_TIMEOUT {
        return Err(anyhow!(
            "Timeout too long: {} seconds (maximum: {})",
            timeout_seconds,
            MAX_TIMEOUT
        ));
    }

    Ok(())
}

pub fn validate_retry(retry: u32) -> Result<()> {
    if retry > MAX_RETRY {
        return Err(anyhow!("Retry count too high: {} (maximum: {})", retry, MAX_RETRY));
    }
    Ok(())
}
