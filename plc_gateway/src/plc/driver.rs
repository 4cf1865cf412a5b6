use thiserror::Error;

use crate::tags::structures::TagValue;

/// Errors surfaced by the PLC driver layer. These never reach HTTP
/// callers; they are folded into health records and metrics.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("timeout")]
    Timeout,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Outcome of reading one address. A transport-level failure is returned
/// as `Err` from `read`; a per-address failure lands in `error` here.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub address: String,
    pub value: Option<TagValue>,
    pub error: Option<String>,
}

impl ReadResult {
    pub fn ok(address: impl Into<String>, value: TagValue) -> Self {
        ReadResult {
            address: address.into(),
            value: Some(value),
            error: None,
        }
    }

    pub fn err(address: impl Into<String>, error: impl Into<String>) -> Self {
        ReadResult {
            address: address.into(),
            value: None,
            error: Some(error.into()),
        }
    }
}

/// The contract every controller driver must implement.
///
/// Drivers are deliberately synchronous: reads block on the wire and are
/// dispatched onto worker threads by the poll engine, never on the OPC UA
/// event loop.
pub trait PlcDriver: Send {
    fn open(&mut self) -> DriverResult<()>;

    fn close(&mut self);

    fn connected(&self) -> bool;

    /// Read a batch of addresses in request order. `Err` means the whole
    /// transaction failed at the transport; per-address problems are
    /// reported through `ReadResult::error`.
    fn read(&mut self, addresses: &[String]) -> DriverResult<Vec<ReadResult>>;
}

/// Builds fresh driver instances for one controller, used by the reconnect
/// state machine when an existing driver cannot be revived.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> DriverResult<Box<dyn PlcDriver>>;
}
