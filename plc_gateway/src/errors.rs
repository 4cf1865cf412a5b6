use thiserror::Error;

use crate::plc::driver::DriverError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OPC UA error: {0}")]
    OpcUa(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
