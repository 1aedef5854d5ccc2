//! Endpoint abstraction for linksvc
//!
//! An endpoint is the device-facing half of a link. The connection loop
//! drives it through three capabilities: Connectable, Readable and Writable.
//!
//! Threading contract: connect(), disconnect() and write() are called with
//! the link lock held, so they never run concurrently with each other.
//! read() is called without the lock, so it may still be blocked while
//! another thread calls disconnect(). Implementations must make disconnect()
//! unblock a pending read, which then returns `Ok(None)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use linkgs::{Counters, LinkResult, MicroserviceKind, Packet, RelayResult};

use crate::config::EndpointConfig;
use crate::endpoint_network::{TcpClientLink, TcpServerLink};
use crate::sim::{FaultHooks, SimConfig, SimLink};

/// Open and close the device connection
pub trait Connectable: Send + Sync {
    fn connect(&self) -> LinkResult<()>;

    /// Close the connection. May block while the device shuts down.
    fn disconnect(&self) -> LinkResult<()>;

    fn connected(&self) -> bool;

    /// Snapshot of the transfer counters
    fn counters(&self) -> Counters;

    fn reset_counters(&self) {}
}

/// Produce packets from the device
pub trait Readable: Send + Sync {
    /// Whether the connection loop should read or only monitor the link
    fn read_allowed(&self) -> LinkResult<bool> {
        Ok(true)
    }

    /// Block until a packet arrives. `Ok(None)` means the link ended.
    fn read(&self) -> LinkResult<Option<Packet>>;
}

/// Send data to the device
pub trait Writable: Send + Sync {
    fn write(&self, packet: &Packet) -> LinkResult<()>;

    /// Send bytes with no framing or processing
    fn write_raw(&self, data: &[u8]) -> LinkResult<()>;
}

/// Everything the engine needs from a device
pub trait Link: Connectable + Readable + Writable {}

impl<T: Connectable + Readable + Writable> Link for T {}

/// The endpoint a microservice owns, tagged with its role
#[derive(Clone)]
pub enum LinkEndpoint {
    Interface(Arc<dyn Link>),
    Router(Arc<dyn Link>),
}

impl LinkEndpoint {
    pub fn new(kind: MicroserviceKind, link: Arc<dyn Link>) -> Self {
        match kind {
            MicroserviceKind::Interface => LinkEndpoint::Interface(link),
            MicroserviceKind::Router => LinkEndpoint::Router(link),
        }
    }

    pub fn kind(&self) -> MicroserviceKind {
        match self {
            LinkEndpoint::Interface(_) => MicroserviceKind::Interface,
            LinkEndpoint::Router(_) => MicroserviceKind::Router,
        }
    }

    pub fn link(&self) -> &dyn Link {
        match self {
            LinkEndpoint::Interface(link) | LinkEndpoint::Router(link) => link.as_ref(),
        }
    }
}

/// Build the endpoint described by the configuration
pub fn build_endpoint(config: &EndpointConfig, kind: MicroserviceKind) -> RelayResult<LinkEndpoint> {
    config.validate()?;

    let link: Arc<dyn Link> = match config {
        EndpointConfig::TcpClient {
            address,
            connect_timeout_ms,
        } => Arc::new(TcpClientLink::new(
            address.clone(),
            Duration::from_millis(*connect_timeout_ms),
        )),
        EndpointConfig::TcpServer { address } => Arc::new(TcpServerLink::new(address.clone())),
        EndpointConfig::Sim {
            packet_size,
            interval_ms,
            read_allowed,
        } => Arc::new(SimLink::new(
            SimConfig {
                packet_size: *packet_size,
                interval: Duration::from_millis(*interval_ms),
                read_allowed: *read_allowed,
                target_name: None,
            },
            FaultHooks::new(),
        )),
    };

    Ok(LinkEndpoint::new(kind, link))
}

/// Counters kept by endpoint implementations. Safe to update from the read
/// path and the write path at the same time.
#[derive(Debug, Default)]
pub struct LinkCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_count: AtomicU64,
    write_count: AtomicU64,
    num_clients: AtomicU64,
}

impl LinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_num_clients(&self, num_clients: usize) {
        self.num_clients.store(num_clients as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Counters {
        Counters {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_count: self.read_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            num_clients: self.num_clients.load(Ordering::Relaxed),
            ..Counters::default()
        }
    }

    /// Zero the transfer counters. The client count is a gauge and is kept.
    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.read_count.store(0, Ordering::Relaxed);
        self.write_count.store(0, Ordering::Relaxed);
    }
}
