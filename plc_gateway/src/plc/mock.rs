//! In-process mock drivers for `GATEWAY_MOCK_PLC` mode.
//!
//! Reads resolve each requested address through the tag store so that mock
//! polls reflect whatever tags the REST API has configured, falling back to
//! a type-appropriate default for unknown addresses.

use std::sync::Arc;

use crate::plc::driver::{DriverFactory, DriverResult, PlcDriver, ReadResult};
use crate::tags::store::TagStore;
use crate::tags::structures::TagValue;

pub struct MockPlcDriver {
    store: Arc<TagStore>,
    fallback: TagValue,
    connected: bool,
}

impl MockPlcDriver {
    pub fn new(store: Arc<TagStore>, fallback: TagValue) -> Self {
        MockPlcDriver {
            store,
            fallback,
            connected: false,
        }
    }
}

impl PlcDriver for MockPlcDriver {
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
            .map(|address| {
                let value = self
                    .store
                    .value_by_address(address)
                    .unwrap_or_else(|| self.fallback.clone());
                ReadResult::ok(address.clone(), value)
            })
            .collect())
    }
}

pub struct MockDriverFactory {
    store: Arc<TagStore>,
    fallback: TagValue,
}

impl MockDriverFactory {
    /// Mock CompactLogix: unknown addresses read as 0.0.
    pub fn logix(store: Arc<TagStore>) -> Self {
        MockDriverFactory {
            store,
            fallback: TagValue::Float(0.0),
        }
    }

    /// Mock SLC 5/05: unknown addresses read as integer 0.
    pub fn slc(store: Arc<TagStore>) -> Self {
        MockDriverFactory {
            store,
            fallback: TagValue::Int(0),
        }
    }
}

impl DriverFactory for MockDriverFactory {
    fn create(&self) -> DriverResult<Box<dyn PlcDriver>> {
        Ok(Box::new(MockPlcDriver::new(
            self.store.clone(),
            self.fallback.clone(),
        )))
    }
}
