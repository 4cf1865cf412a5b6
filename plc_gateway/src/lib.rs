//! PLC gateway: bridges Allen-Bradley CompactLogix and SLC 5/05
//! controllers to an OPC UA server and a JSON REST API.
//!
//! The gateway polls configured controller addresses on a fixed period,
//! scales and stores the values, and mirrors them into an OPC UA address
//! space. Tag metadata is runtime-mutable through the REST API; a
//! per-controller reconnect state machine with exponential backoff keeps
//! polling alive across controller outages.

pub mod api;
pub mod config;
pub mod errors;
pub mod logging;
pub mod loki;
pub mod metrics;
pub mod opcua;
pub mod plc;
pub mod runtime;
pub mod tags;
