//! The poll engine: one cycle per `POLL_PERIOD` across all controllers.
//!
//! Each tick runs reconnect + read for every controller concurrently on
//! blocking worker threads (driver I/O never touches the async loop),
//! writes the results into the tag store, mirrors values to the OPC UA
//! variables, then stamps timestamps and readiness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::settings::Settings;
use crate::metrics;
use crate::opcua::bridge::OpcUaBridge;
use crate::plc::driver::{DriverFactory, PlcDriver, ReadResult};
use crate::plc::health::HealthRegistry;
use crate::plc::reconnect::{ensure_connected, ReconnectPolicy};
use crate::runtime::{LastUpdate, ReadinessGate, ShutdownSignal};
use crate::tags::store::TagStore;

/// Static description of one polled controller; the driver itself moves
/// in and out of worker threads between ticks.
#[derive(Clone)]
pub struct LineTemplate {
    /// Logical controller key, matching `Tag::plc_id`.
    pub key: String,
    /// Issue one batched read per cycle (CompactLogix); otherwise read
    /// each address on its own (SLC 5/05).
    pub batch_reads: bool,
    pub factory: Arc<dyn DriverFactory>,
}

pub struct PollEngine {
    store: Arc<TagStore>,
    health: Arc<HealthRegistry>,
    settings: Arc<Settings>,
    shutdown: Arc<ShutdownSignal>,
    readiness: Arc<ReadinessGate>,
    last_update: Arc<LastUpdate>,
    bridge: Option<Arc<Mutex<OpcUaBridge>>>,
    lines: Vec<(LineTemplate, Option<Box<dyn PlcDriver>>)>,
}

impl PollEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TagStore>,
        health: Arc<HealthRegistry>,
        settings: Arc<Settings>,
        shutdown: Arc<ShutdownSignal>,
        readiness: Arc<ReadinessGate>,
        last_update: Arc<LastUpdate>,
        lines: Vec<(LineTemplate, Option<Box<dyn PlcDriver>>)>,
    ) -> Self {
        PollEngine {
            store,
            health,
            settings,
            shutdown,
            readiness,
            last_update,
            bridge: None,
            lines,
        }
    }

    /// Attach the OPC UA bridge so each cycle mirrors values to variable
    /// nodes. Without a bridge (tests, startup race) cycles still poll.
    pub fn with_bridge(mut self, bridge: Arc<Mutex<OpcUaBridge>>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub async fn run(mut self) {
        info!("Polling task started");
        let poll_period = Duration::from_secs_f64(self.settings.poll_period.max(0.01));
        let shutdown = self.shutdown.clone();
        loop {
            self.run_cycle().await;
            if shutdown.is_triggered() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_period) => {}
                _ = shutdown.triggered() => break,
            }
        }
        self.close_drivers();
        info!("Polling task stopped");
    }

    /// One complete poll cycle. Public so tests can drive single cycles.
    pub async fn run_cycle(&mut self) {
        let cycle_start = Instant::now();

        let templates: Vec<LineTemplate> =
            self.lines.iter().map(|(tpl, _)| tpl.clone()).collect();
        let mut joins = Vec::with_capacity(self.lines.len());
        for (template, driver) in self.lines.drain(..) {
            let store = self.store.clone();
            let health = self.health.clone();
            let shutdown = self.shutdown.clone();
            let policy = ReconnectPolicy {
                key: template.key.clone(),
                force_fail: self.settings.mock_fail_reconnect,
                mock_plc: self.settings.mock_plc,
            };
            joins.push(tokio::task::spawn_blocking(move || {
                let driver = poll_line(&template, driver, &policy, &store, &health, &shutdown);
                (template, driver)
            }));
        }
        for (index, join) in joins.into_iter().enumerate() {
            match join.await {
                Ok((template, driver)) => self.lines.push((template, driver)),
                Err(e) => {
                    error!("Read worker failed: {}", e);
                    // The driver died with the worker; the reconnect tick
                    // rebuilds one on the next cycle.
                    self.lines.push((templates[index].clone(), None));
                }
            }
        }

        if self.shutdown.is_triggered() {
            return;
        }

        if let Some(bridge) = &self.bridge {
            bridge.lock().await.sync_values();
        }

        self.last_update.stamp_now();
        metrics::POLL_LATENCY.observe(cycle_start.elapsed().as_secs_f64());
        self.readiness.mark_ready(self.last_update.epoch_seconds());
    }

    fn close_drivers(&mut self) {
        for (_, driver) in &mut self.lines {
            if let Some(d) = driver.as_deref_mut() {
                d.close();
            }
        }
    }
}

/// Reconnect gate, shutdown check and read for one controller. Runs on a
/// blocking worker thread; the driver is owned here for the duration, so
/// at most one read is ever in flight per driver.
fn poll_line(
    template: &LineTemplate,
    driver: Option<Box<dyn PlcDriver>>,
    policy: &ReconnectPolicy,
    store: &TagStore,
    health: &HealthRegistry,
    shutdown: &ShutdownSignal,
) -> Option<Box<dyn PlcDriver>> {
    let mut driver = ensure_connected(driver, template.factory.as_ref(), policy, health);
    if shutdown.is_triggered() {
        debug!("{}: shutdown signalled; skipping read", template.key);
        return driver;
    }
    if let Some(d) = driver.as_deref_mut() {
        if !d.connected() {
            health.record_not_connected(&template.key);
            info!("{} driver not connected; skipping read", template.key);
            return driver;
        }
        let targets = store.poll_targets(&template.key);
        if targets.is_empty() {
            debug!("No {} tags configured; skipping read", template.key);
            return driver;
        }
        if template.batch_reads {
            batch_read(d, &targets, store, health, &template.key);
        } else {
            sequential_read(d, &targets, store, health, &template.key);
        }
    }
    driver
}

fn apply_results(store: &TagStore, targets: &[(String, String)], results: &[ReadResult]) {
    for ((tag_id, _), result) in targets.iter().zip(results.iter()) {
        if result.error.is_none() {
            if let Some(value) = &result.value {
                store.set_value(tag_id, value.clone());
            }
        }
    }
}

fn log_read_summary(key: &str, targets: &[(String, String)]) {
    let sample: Vec<&str> = targets.iter().take(3).map(|(tid, _)| tid.as_str()).collect();
    info!(
        "{} read: updated {} tags (sample_keys={})",
        key,
        targets.len(),
        sample.join(",")
    );
}

/// One batched read; a transport-level failure falls back to per-address
/// reads so a driver without batch support still serves its tags.
fn batch_read(
    driver: &mut dyn PlcDriver,
    targets: &[(String, String)],
    store: &TagStore,
    health: &HealthRegistry,
    key: &str,
) {
    let addresses: Vec<String> = targets.iter().map(|(_, addr)| addr.clone()).collect();
    match driver.read(&addresses) {
        Ok(results) => {
            apply_results(store, targets, &results);
            health.record_read_success(key);
            log_read_summary(key, targets);
        }
        Err(batch_error) => {
            warn!(
                "{} batch read failed ({}); falling back to per-address reads",
                key, batch_error
            );
            let mut any_ok = false;
            for (tag_id, address) in targets {
                match driver.read(std::slice::from_ref(address)) {
                    Ok(results) => {
                        any_ok = true;
                        apply_results(
                            store,
                            std::slice::from_ref(&(tag_id.clone(), address.clone())),
                            &results,
                        );
                    }
                    Err(e) => {
                        error!(
                            "{} per-address read failed for {} ({}): {}",
                            key, address, tag_id, e
                        );
                    }
                }
            }
            if any_ok {
                health.record_read_success(key);
                log_read_summary(key, targets);
            } else {
                health.record_read_failure(key, &batch_error.to_string());
            }
        }
    }
}

/// Conservative one-address-at-a-time reads (SLC 5/05 style).
fn sequential_read(
    driver: &mut dyn PlcDriver,
    targets: &[(String, String)],
    store: &TagStore,
    health: &HealthRegistry,
    key: &str,
) {
    let mut any_ok = false;
    let mut last_error: Option<String> = None;
    for (tag_id, address) in targets {
        match driver.read(std::slice::from_ref(address)) {
            Ok(results) => {
                any_ok = true;
                apply_results(
                    store,
                    std::slice::from_ref(&(tag_id.clone(), address.clone())),
                    &results,
                );
            }
            Err(e) => {
                error!(
                    "{} per-address read failed for {} ({}): {}",
                    key, address, tag_id, e
                );
                last_error = Some(e.to_string());
            }
        }
    }
    if any_ok {
        health.record_read_success(key);
        log_read_summary(key, targets);
    } else if let Some(message) = last_error {
        health.record_read_failure(key, &message);
    }
}
