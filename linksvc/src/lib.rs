//! LinkSvc - Connection microservice engine
//!
//! Keeps one interface or router link alive: a reconnect loop owns the
//! connection state, a dispatch worker forwards commands and telemetry to the
//! endpoint, and a status publisher keeps the status record fresh.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod endpoint_network;
pub mod microservice;
pub mod sim;
pub mod sleeper;
pub mod status_publisher;

pub use config::*;
pub use connection::*;
pub use dispatch::*;
pub use endpoint::*;
pub use endpoint_network::*;
pub use microservice::*;
pub use sim::*;
pub use sleeper::*;
pub use status_publisher::*;
