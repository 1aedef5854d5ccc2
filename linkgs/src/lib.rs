//! LinkSvc Ground Shared Library (linkgs)
//!
//! This library contains definitions shared between the connection engine
//! (linksvc) and anything that observes or drives it: microservice identity,
//! connection state, counters, the status store and the message bus.

pub mod types;
pub mod status;
pub mod bus;
pub mod error;

pub use types::*;
pub use status::*;
pub use bus::*;
pub use error::*;
