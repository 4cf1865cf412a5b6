//! Best-effort push of recent PLC errors to a Loki endpoint.
//!
//! Entries are queued on an unbounded channel and shipped by a background
//! task; failures are logged and never propagate to the caller.

use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::error;

#[derive(Debug)]
pub struct LokiEntry {
    pub plc: String,
    pub ip: String,
    pub ts: f64,
    pub message: String,
}

/// Cheap-to-clone handle; a disabled handle drops entries silently.
#[derive(Clone, Default)]
pub struct LokiHandle {
    tx: Option<UnboundedSender<LokiEntry>>,
}

impl LokiHandle {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: LokiEntry) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(entry);
        }
    }
}

/// Spawn the pusher task for the given push URL and return its handle.
/// Must be called from within a tokio runtime.
pub fn spawn_pusher(url: String) -> LokiHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<LokiEntry>();
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to build Loki HTTP client: {}", e);
                return;
            }
        };
        while let Some(entry) = rx.recv().await {
            let payload = json!({
                "streams": [{
                    "stream": { "plc": entry.plc, "ip": entry.ip },
                    "values": [[format!("{}", (entry.ts * 1e9) as i64), entry.message]],
                }]
            });
            if let Err(e) = client.post(&url).json(&payload).send().await {
                error!("Failed to push logs to Loki at {}: {}", url, e);
            }
        }
    });
    LokiHandle { tx: Some(tx) }
}
