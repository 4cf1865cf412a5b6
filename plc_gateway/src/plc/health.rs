//! Per-controller health accounting.
//!
//! One `PlcHealth` record per logical PLC, living for the whole process.
//! The poll engine and reconnect state machine mutate records; the REST
//! health endpoint snapshots them. Dashmap gives per-entry locking, so
//! readers may see slightly stale but never torn records.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::settings::Settings;
use crate::loki::{LokiEntry, LokiHandle};
use crate::metrics;
use crate::plc::reconnect::compute_backoff_delay;
use crate::runtime::epoch_seconds;

/// Most recent errors retained per controller.
const RECENT_ERRORS_CAP: usize = 10;

pub const COMPACTLOGIX: &str = "compactlogix";
pub const SLC500: &str = "slc500";

#[derive(Debug, Clone, Default)]
pub struct PlcHealth {
    pub ok: bool,
    pub last_success: f64,
    pub last_error: Option<String>,
    pub fail_count: u32,
    pub next_attempt: f64,
    /// None until a backoff has been recorded; the health endpoint falls
    /// back to `compute_backoff_delay(fail_count)` in that case.
    pub last_backoff: Option<f64>,
    pub recent_errors: VecDeque<(f64, String)>,
}

/// JSON-safe copy of one health record, as served by `/api/v1/hmi/health`.
#[derive(Debug, Serialize)]
pub struct PlcHealthSnapshot {
    pub ok: bool,
    pub last_success: f64,
    pub last_error: Option<String>,
    pub fail_count: u32,
    pub next_attempt: f64,
    pub last_backoff: f64,
    pub recent_errors: Vec<RecentError>,
}

#[derive(Debug, Serialize)]
pub struct RecentError {
    pub ts: f64,
    pub error: String,
}

/// Map a raw error message onto a low-cardinality code for metrics and
/// dashboards. Case-insensitive substring match, in priority order.
pub fn normalize_error_code(message: &str) -> &'static str {
    if message.is_empty() {
        return "UNKNOWN";
    }
    let m = message.to_ascii_lowercase();
    if m.contains("forced reconnect") {
        "FORCED_RECONNECT"
    } else if m.contains("recreate error") {
        "RECREATE_ERROR"
    } else if m.contains("not connected") {
        "NOT_CONNECTED"
    } else if m.contains("timeout") || m.contains("timed out") {
        "TIMEOUT"
    } else if m.contains("socket") {
        "SOCKET_ERROR"
    } else {
        "OTHER"
    }
}

pub struct HealthRegistry {
    entries: DashMap<String, PlcHealth>,
    ips: DashMap<String, String>,
    loki: LokiHandle,
    reconnect_base: f64,
    reconnect_max: f64,
}

impl HealthRegistry {
    pub fn new(settings: &Settings, loki: LokiHandle) -> Self {
        let registry = HealthRegistry {
            entries: DashMap::new(),
            ips: DashMap::new(),
            loki,
            reconnect_base: settings.reconnect_base,
            reconnect_max: settings.reconnect_max,
        };
        registry.register(COMPACTLOGIX, settings.compactlogix_ip.clone());
        registry.register(SLC500, settings.slc500_ip.clone());
        registry
    }

    pub fn register(&self, key: &str, ip: Option<String>) {
        self.entries.insert(key.to_string(), PlcHealth::default());
        self.ips
            .insert(key.to_string(), ip.unwrap_or_default());
    }

    fn ip(&self, key: &str) -> String {
        self.ips.get(key).map(|e| e.clone()).unwrap_or_default()
    }

    /// The backoff gate: attempts are allowed once `now >= next_attempt`.
    pub fn gate_open(&self, key: &str, now: f64) -> bool {
        self.entries
            .get(key)
            .map(|h| now >= h.next_attempt)
            .unwrap_or(true)
    }

    pub fn get(&self, key: &str) -> Option<PlcHealth> {
        self.entries.get(key).map(|h| h.clone())
    }

    /// Record the initial connection state observed when drivers are first
    /// opened at startup.
    pub fn set_initial_ok(&self, key: &str, ok: bool) {
        if let Some(mut h) = self.entries.get_mut(key) {
            h.ok = ok;
        }
        let ip = self.ip(key);
        metrics::CONNECTED
            .with_label_values(&[key, ip.as_str()])
            .set(if ok { 1.0 } else { 0.0 });
    }

    /// A poll read completed: clear the failure state.
    pub fn record_read_success(&self, key: &str) {
        if let Some(mut h) = self.entries.get_mut(key) {
            h.ok = true;
            h.last_success = epoch_seconds();
            h.last_error = None;
            h.fail_count = 0;
            h.next_attempt = 0.0;
            h.last_backoff = Some(0.0);
        }
        let ip = self.ip(key);
        metrics::CONNECTED.with_label_values(&[key, ip.as_str()]).set(1.0);
        metrics::FAIL_COUNT.with_label_values(&[key, ip.as_str()]).set(0.0);
    }

    /// A poll read failed. Failure is counted but the backoff gate is not
    /// engaged here; the next reconnect tick decides that.
    pub fn record_read_failure(&self, key: &str, message: &str) {
        let now = epoch_seconds();
        if let Some(mut h) = self.entries.get_mut(key) {
            h.ok = false;
            h.last_error = Some(message.to_string());
            h.fail_count += 1;
            push_recent(&mut h, now, message);
        }
        self.publish_error(key, now, message);
        let ip = self.ip(key);
        metrics::CONNECTED.with_label_values(&[key, ip.as_str()]).set(0.0);
        if let Some(h) = self.entries.get(key) {
            metrics::FAIL_COUNT
                .with_label_values(&[key, ip.as_str()])
                .set(h.fail_count as f64);
        }
    }

    /// The driver is not connected this tick; the read was skipped.
    pub fn record_not_connected(&self, key: &str) {
        if let Some(mut h) = self.entries.get_mut(key) {
            h.ok = false;
            h.last_error = Some("not connected".to_string());
        }
        let ip = self.ip(key);
        metrics::CONNECTED.with_label_values(&[key, ip.as_str()]).set(0.0);
        if let Some(h) = self.entries.get(key) {
            metrics::FAIL_COUNT
                .with_label_values(&[key, ip.as_str()])
                .set(h.fail_count as f64);
        }
    }

    /// Reconnect succeeded (or the driver was already connected): zero the
    /// failure counters and the gate.
    pub fn record_reconnect_success(&self, key: &str) {
        if let Some(mut h) = self.entries.get_mut(key) {
            h.fail_count = 0;
            h.next_attempt = 0.0;
            h.last_backoff = Some(0.0);
        }
        let ip = self.ip(key);
        metrics::CONNECTED.with_label_values(&[key, ip.as_str()]).set(1.0);
        metrics::FAIL_COUNT.with_label_values(&[key, ip.as_str()]).set(0.0);
    }

    /// Reconnect failed: count the failure, compute the exponential delay
    /// and close the gate until `now + delay`. Returns the delay applied.
    pub fn record_reconnect_failure(&self, key: &str, message: &str) -> f64 {
        let now = epoch_seconds();
        let mut delay = 0.0;
        let mut fail_count = 0;
        if let Some(mut h) = self.entries.get_mut(key) {
            push_recent(&mut h, now, message);
            h.fail_count += 1;
            fail_count = h.fail_count;
            delay = compute_backoff_delay(self.reconnect_base, self.reconnect_max, fail_count);
            h.next_attempt = now + delay;
            h.last_backoff = Some(delay);
        }
        self.publish_error(key, now, message);
        let ip = self.ip(key);
        metrics::LAST_BACKOFF.with_label_values(&[key, ip.as_str()]).set(delay);
        metrics::FAIL_COUNT
            .with_label_values(&[key, ip.as_str()])
            .set(fail_count as f64);
        metrics::RECONNECTS.with_label_values(&[key, ip.as_str()]).inc();
        metrics::CONNECTED.with_label_values(&[key, ip.as_str()]).set(0.0);
        delay
    }

    fn publish_error(&self, key: &str, ts: f64, message: &str) {
        let ip = self.ip(key);
        if let Some(h) = self.entries.get(key) {
            metrics::RECENT_ERRORS_COUNT
                .with_label_values(&[key, ip.as_str()])
                .set(h.recent_errors.len() as f64);
        }
        metrics::RECENT_ERROR_LAST_TS
            .with_label_values(&[key, ip.as_str()])
            .set(ts);
        metrics::RECENT_ERROR_CODE
            .with_label_values(&[key, ip.as_str(), normalize_error_code(message)])
            .set(1.0);
        self.loki.push(LokiEntry {
            plc: key.to_string(),
            ip,
            ts,
            message: message.to_string(),
        });
    }

    /// JSON-safe copies for the health endpoint.
    pub fn snapshot(&self) -> Vec<(String, PlcHealthSnapshot)> {
        self.entries
            .iter()
            .map(|entry| {
                let h = entry.value();
                let last_backoff = h.last_backoff.unwrap_or_else(|| {
                    compute_backoff_delay(self.reconnect_base, self.reconnect_max, h.fail_count)
                });
                (
                    entry.key().clone(),
                    PlcHealthSnapshot {
                        ok: h.ok,
                        last_success: h.last_success,
                        last_error: h.last_error.clone(),
                        fail_count: h.fail_count,
                        next_attempt: h.next_attempt,
                        last_backoff,
                        recent_errors: h
                            .recent_errors
                            .iter()
                            .map(|(ts, error)| RecentError {
                                ts: *ts,
                                error: error.clone(),
                            })
                            .collect(),
                    },
                )
            })
            .collect()
    }

    /// Directly set the recorded backoff, used by tests exercising the
    /// health endpoint.
    pub fn set_last_backoff(&self, key: &str, backoff: f64) {
        if let Some(mut h) = self.entries.get_mut(key) {
            h.last_backoff = Some(backoff);
        }
    }
}

fn push_recent(health: &mut PlcHealth, ts: f64, message: &str) {
    if health.recent_errors.len() == RECENT_ERRORS_CAP {
        health.recent_errors.pop_front();
    }
    health.recent_errors.push_back((ts, message.to_string()));
}
