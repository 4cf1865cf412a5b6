use std::sync::atomic::{AtomicUsize, Ordering};

use plc_gateway::config::settings::Settings;
use plc_gateway::loki::LokiHandle;
use plc_gateway::plc::driver::{DriverError, DriverFactory, DriverResult, PlcDriver, ReadResult};
use plc_gateway::plc::health::{normalize_error_code, HealthRegistry, COMPACTLOGIX};
use plc_gateway::plc::reconnect::{compute_backoff_delay, ensure_connected, ReconnectPolicy};
use plc_gateway::tags::structures::TagValue;

struct StubDriver {
    connected: bool,
}

impl PlcDriver for StubDriver {
    fn open(&mut self) -> DriverResult<()> {
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self, addresses: &[String]) -> DriverResult<Vec<ReadResult>> {
        Ok(addresses
            .iter()
            .map(|a| ReadResult::ok(a.clone(), TagValue::Int(1)))
            .collect())
    }
}

#[derive(Default)]
struct FailingFactory {
    calls: AtomicUsize,
}

impl FailingFactory {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DriverFactory for FailingFactory {
    fn create(&self) -> DriverResult<Box<dyn PlcDriver>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DriverError::ConnectionFailed("create-failed".to_string()))
    }
}

#[derive(Default)]
struct WorkingFactory;

impl DriverFactory for WorkingFactory {
    fn create(&self) -> DriverResult<Box<dyn PlcDriver>> {
        Ok(Box::new(StubDriver { connected: false }))
    }
}

fn policy() -> ReconnectPolicy {
    ReconnectPolicy {
        key: COMPACTLOGIX.to_string(),
        force_fail: false,
        mock_plc: false,
    }
}

fn registry() -> HealthRegistry {
    HealthRegistry::new(&Settings::default(), LokiHandle::disabled())
}

#[test]
fn backoff_delay_matches_contract() {
    // With base 1 and max 4 the first five delays are 0, 1, 2, 4, 4.
    let expected = [0.0, 1.0, 2.0, 4.0, 4.0];
    for (n, want) in expected.iter().enumerate() {
        assert_eq!(compute_backoff_delay(1.0, 4.0, n as u32), *want);
    }
}

#[test]
fn failing_recreation_sets_backoff_and_gate() {
    let health = registry();
    let factory = FailingFactory::default();

    let driver = ensure_connected(None, &factory, &policy(), &health);
    assert!(driver.is_none());
    assert_eq!(factory.calls(), 1);

    let h = health.get(COMPACTLOGIX).unwrap();
    assert_eq!(h.fail_count, 1);
    assert_eq!(h.last_backoff, Some(1.0));
    assert!(h.next_attempt > 0.0);
    let (_, message) = h.recent_errors.back().unwrap();
    assert!(message.starts_with("recreate error:"));
    assert_eq!(normalize_error_code(message), "RECREATE_ERROR");

    // The gate is closed for the next second; the tick must not attempt
    // another recreation.
    let driver = ensure_connected(driver, &factory, &policy(), &health);
    assert!(driver.is_none());
    assert_eq!(factory.calls(), 1);
    assert_eq!(health.get(COMPACTLOGIX).unwrap().fail_count, 1);
}

#[test]
fn fresh_driver_is_opened_and_clears_fail_state() {
    let health = registry();
    // A read failure counts failures without engaging the gate.
    health.record_read_failure(COMPACTLOGIX, "read exploded");
    assert_eq!(health.get(COMPACTLOGIX).unwrap().fail_count, 1);

    let driver = ensure_connected(None, &WorkingFactory, &policy(), &health);
    let driver = driver.expect("driver created");
    assert!(driver.connected());

    let h = health.get(COMPACTLOGIX).unwrap();
    assert_eq!(h.fail_count, 0);
    assert_eq!(h.next_attempt, 0.0);
    assert_eq!(h.last_backoff, Some(0.0));
}

#[test]
fn connected_driver_short_circuits() {
    let health = registry();
    let factory = FailingFactory::default();
    let driver: Box<dyn PlcDriver> = Box::new(StubDriver { connected: true });

    let driver = ensure_connected(Some(driver), &factory, &policy(), &health);
    assert!(driver.unwrap().connected());
    // No recreation was needed.
    assert_eq!(factory.calls(), 0);
    assert_eq!(health.get(COMPACTLOGIX).unwrap().fail_count, 0);
}

#[test]
fn disconnected_driver_is_reopened_in_place() {
    let health = registry();
    let factory = FailingFactory::default();
    let driver: Box<dyn PlcDriver> = Box::new(StubDriver { connected: false });

    let driver = ensure_connected(Some(driver), &factory, &policy(), &health);
    // open() succeeded on the existing driver, so the factory stayed idle.
    assert!(driver.unwrap().connected());
    assert_eq!(factory.calls(), 0);
}

#[test]
fn forced_failure_hook_records_synthetic_backoff() {
    let health = registry();
    let factory = FailingFactory::default();
    let policy = ReconnectPolicy {
        key: COMPACTLOGIX.to_string(),
        force_fail: true,
        mock_plc: false,
    };

    let driver = ensure_connected(None, &factory, &policy, &health);
    assert!(driver.is_none());
    // The synthetic failure short-circuits before any driver work.
    assert_eq!(factory.calls(), 0);

    let h = health.get(COMPACTLOGIX).unwrap();
    assert_eq!(h.fail_count, 1);
    assert!(h.last_backoff.unwrap() > 0.0);
    let (_, message) = h.recent_errors.back().unwrap();
    assert_eq!(normalize_error_code(message), "FORCED_RECONNECT");
}
