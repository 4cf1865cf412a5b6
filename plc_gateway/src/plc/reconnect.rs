//! Reconnect state machine with exponential backoff.
//!
//! One gate per logical controller, evaluated at the start of every poll
//! tick. The gate predicate is `now >= next_attempt`; while closed, the
//! current driver is returned untouched and no attempt is made.

use tracing::{debug, info};

use crate::plc::driver::{DriverFactory, PlcDriver};
use crate::plc::health::HealthRegistry;
use crate::runtime::epoch_seconds;

/// `0` for a clean slate, otherwise `min(base * 2^(n-1), max)`.
pub fn compute_backoff_delay(base: f64, max: f64, fail_count: u32) -> f64 {
    if fail_count == 0 {
        return 0.0;
    }
    (base * 2f64.powi(fail_count as i32 - 1)).min(max)
}

/// Per-controller knobs for `ensure_connected`.
pub struct ReconnectPolicy {
    pub key: String,
    /// Force a synthetic failure per tick while no driver exists; only
    /// honored outside mock mode (mock mode pre-populates one failure at
    /// startup instead, so the first real poll can still complete).
    pub force_fail: bool,
    pub mock_plc: bool,
}

/// Ensure a live driver for one controller, consuming and returning the
/// driver so the caller keeps sole ownership between ticks.
///
/// On failure the health registry picks up the failure accounting and the
/// backoff gate; the previous driver (possibly `None`) is handed back so
/// the next open tick retries.
pub fn ensure_connected(
    driver: Option<Box<dyn PlcDriver>>,
    factory: &dyn DriverFactory,
    policy: &ReconnectPolicy,
    health: &HealthRegistry,
) -> Option<Box<dyn PlcDriver>> {
    let now = epoch_seconds();
    if !health.gate_open(&policy.key, now) {
        debug!(plc = %policy.key, "Backoff gate closed; skipping reconnect attempt");
        return driver;
    }

    if policy.force_fail && driver.is_none() && !policy.mock_plc {
        let delay =
            health.record_reconnect_failure(&policy.key, "forced reconnect failure (test)");
        info!(plc = %policy.key, delay, "(test) Forced reconnect failure recorded");
        return driver;
    }

    let mut driver = driver;
    let mut revived = false;
    if let Some(d) = driver.as_deref_mut() {
        revived = d.connected() || (d.open().is_ok() && d.connected());
    }
    if revived {
        health.record_reconnect_success(&policy.key);
        return driver;
    }

    // The existing driver is beyond revival (or absent); build a fresh one
    // for the same controller.
    match factory.create() {
        Ok(mut fresh) => match fresh.open() {
            Ok(()) => {
                if fresh.connected() {
                    health.record_reconnect_success(&policy.key);
                }
                Some(fresh)
            }
            Err(e) => {
                let delay = health
                    .record_reconnect_failure(&policy.key, &format!("recreate error: {e}"));
                info!(plc = %policy.key, delay, "Backoff engaged after reconnect failure");
                driver
            }
        },
        Err(e) => {
            let delay =
                health.record_reconnect_failure(&policy.key, &format!("recreate error: {e}"));
            info!(plc = %policy.key, delay, "Backoff engaged after driver recreation failure");
            driver
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_doubles_and_caps() {
        assert_eq!(compute_backoff_delay(1.0, 4.0, 0), 0.0);
        assert_eq!(compute_backoff_delay(1.0, 4.0, 1), 1.0);
        assert_eq!(compute_backoff_delay(1.0, 4.0, 2), 2.0);
        assert_eq!(compute_backoff_delay(1.0, 4.0, 3), 4.0);
        assert_eq!(compute_backoff_delay(1.0, 4.0, 4), 4.0);
    }

    #[test]
    fn backoff_delay_default_limits() {
        assert_eq!(compute_backoff_delay(1.0, 60.0, 1), 1.0);
        assert_eq!(compute_backoff_delay(1.0, 60.0, 6), 32.0);
        assert_eq!(compute_backoff_delay(1.0, 60.0, 7), 60.0);
        assert_eq!(compute_backoff_delay(1.0, 60.0, 100), 60.0);
    }
}
