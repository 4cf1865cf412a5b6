use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tracing::{error, info};

use crate::config::settings::Settings;
use crate::loki::LokiHandle;
use crate::opcua::bridge::NodeCommandSender;
use crate::plc::health::HealthRegistry;
use crate::tags::store::TagStore;

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Cooperative shutdown signal shared between the REST surface, the poll
/// engine and the OPC UA runtime. Level-triggered: once set it stays set.
#[derive(Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been triggered. Safe to call from any
    /// number of tasks; returns immediately when already triggered.
    pub async fn triggered(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Write-once readiness gate. Flips true after the first completed poll
/// cycle and never reverts; optionally drops a marker file containing the
/// epoch-seconds timestamp of that first poll.
pub struct ReadinessGate {
    ready: AtomicBool,
    ready_file: Option<PathBuf>,
}

impl ReadinessGate {
    pub fn new(ready_file: Option<PathBuf>) -> Self {
        Self {
            ready: AtomicBool::new(false),
            ready_file,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Mark the gateway ready. Only the first call has any effect; returns
    /// true when this call performed the transition.
    pub fn mark_ready(&self, timestamp: f64) -> bool {
        if self
            .ready
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        info!("Server marked ready after first successful PLC poll");
        if let Some(path) = &self.ready_file {
            if let Err(e) = std::fs::write(path, format!("{timestamp}")) {
                error!("Failed to write ready file {}: {}", path.display(), e);
            }
        }
        true
    }
}

/// Timestamp of the most recent completed poll cycle, readable from the
/// health endpoint without locking. Stored as epoch milliseconds; zero
/// means no cycle has completed yet.
#[derive(Default)]
pub struct LastUpdate {
    millis: AtomicU64,
}

impl LastUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp_now(&self) {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.millis.store(ms, Ordering::SeqCst);
    }

    pub fn epoch_seconds(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

/// Application context shared by every component: the tag store, health
/// table and orchestration signals travel as explicit fields rather than
/// process-wide globals.
#[derive(Clone)]
pub struct GatewayContext {
    pub settings: Arc<Settings>,
    pub store: Arc<TagStore>,
    pub health: Arc<HealthRegistry>,
    pub shutdown: Arc<ShutdownSignal>,
    pub readiness: Arc<ReadinessGate>,
    pub last_update: Arc<LastUpdate>,
    pub nodes: NodeCommandSender,
}

impl GatewayContext {
    pub fn new(settings: Settings, loki: LokiHandle) -> Self {
        let readiness = Arc::new(ReadinessGate::new(settings.ready_file.clone()));
        let health = Arc::new(HealthRegistry::new(&settings, loki));
        GatewayContext {
            settings: Arc::new(settings),
            store: Arc::new(TagStore::new()),
            health,
            shutdown: Arc::new(ShutdownSignal::new()),
            readiness,
            last_update: Arc::new(LastUpdate::new()),
            nodes: NodeCommandSender::new(),
        }
    }
}
