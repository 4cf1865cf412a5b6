pub mod driver;
pub mod eip;
pub mod health;
pub mod mock;
pub mod poller;
pub mod reconnect;
