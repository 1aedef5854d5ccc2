//! Simulated link
//!
//! Produces a packet every `interval` while connected: a big-endian sequence
//! number followed by random bytes. Written packets are kept so callers can
//! see what reached the "device".
//!
//! FaultHooks are the test seam. Each hook is owned by one link instance, so
//! tests running side by side do not see each other's faults.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::debug;
use rand::Rng;

use linkgs::{Counters, LinkError, LinkResult, Packet};

use crate::config::constants::{SIM_INTERVAL, SIM_PACKET_SIZE};
use crate::endpoint::{Connectable, LinkCounters, Readable, Writable};

/// Error message of every injected fault
pub const INJECTED_ERROR: &str = "test-error";

/// Switchable faults and call counters for a SimLink
#[derive(Debug, Default)]
pub struct FaultHooks {
    connect_error: AtomicBool,
    read_error: AtomicBool,
    read_allowed_error: AtomicBool,
    disconnect_delay_ms: AtomicU64,
    connect_calls: AtomicU64,
    read_calls: AtomicU64,
    disconnect_calls: AtomicU64,
}

impl FaultHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make connect() fail without connecting
    pub fn fail_connect(&self, fail: bool) {
        self.connect_error.store(fail, Ordering::SeqCst);
    }

    /// Make read() fail
    pub fn fail_read(&self, fail: bool) {
        self.read_error.store(fail, Ordering::SeqCst);
    }

    /// Make read_allowed() fail
    pub fn fail_read_allowed(&self, fail: bool) {
        self.read_allowed_error.store(fail, Ordering::SeqCst);
    }

    /// Make disconnect() take this long before the link reports closed
    pub fn set_disconnect_delay(&self, delay: Duration) {
        self.disconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u64 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

/// Shape of the simulated traffic
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub packet_size: usize,
    pub interval: Duration,
    pub read_allowed: bool,
    /// Target stamped on produced packets
    pub target_name: Option<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            packet_size: SIM_PACKET_SIZE,
            interval: SIM_INTERVAL,
            read_allowed: true,
            target_name: None,
        }
    }
}

pub struct SimLink {
    config: SimConfig,
    hooks: Arc<FaultHooks>,
    connected: AtomicBool,
    /// Cleared first thing in disconnect() so a pending read ends
    data_available: AtomicBool,
    sequence: AtomicU32,
    counters: LinkCounters,
    written: Mutex<Vec<Vec<u8>>>,
}

impl SimLink {
    pub fn new(config: SimConfig, hooks: Arc<FaultHooks>) -> Self {
        Self {
            config,
            hooks,
            connected: AtomicBool::new(false),
            data_available: AtomicBool::new(false),
            sequence: AtomicU32::new(0),
            counters: LinkCounters::new(),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn hooks(&self) -> &Arc<FaultHooks> {
        &self.hooks
    }

    /// Buffers written so far, oldest first
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn generate_packet(&self) -> Packet {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut rng = rand::thread_rng();
        let mut buffer = Vec::with_capacity(self.config.packet_size);

        buffer.extend_from_slice(&sequence.to_be_bytes());
        for _ in 4..self.config.packet_size {
            buffer.push(rng.gen());
        }
        buffer.resize(self.config.packet_size, 0);

        let mut packet = Packet::new(buffer);
        packet.target_name = self.config.target_name.clone();
        packet
    }

    fn store_write(&self, data: &[u8]) -> LinkResult<()> {
        if !self.connected() {
            return Err(LinkError::NotConnected("Sim link not connected".to_string()));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
        self.counters.record_write(data.len());
        Ok(())
    }
}

impl Connectable for SimLink {
    fn connect(&self) -> LinkResult<()> {
        self.hooks.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.hooks.connect_error.load(Ordering::SeqCst) {
            return Err(LinkError::runtime(INJECTED_ERROR));
        }
        self.data_available.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> LinkResult<()> {
        self.hooks.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.data_available.store(false, Ordering::SeqCst);

        let delay = self.hooks.disconnect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            debug!("Sim link disconnect waiting {} ms", delay);
            thread::sleep(Duration::from_millis(delay));
        }

        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn counters(&self) -> Counters {
        self.counters.snapshot()
    }

    fn reset_counters(&self) {
        self.counters.reset();
    }
}

impl Readable for SimLink {
    fn read_allowed(&self) -> LinkResult<bool> {
        if self.hooks.read_allowed_error.load(Ordering::SeqCst) {
            return Err(LinkError::runtime(INJECTED_ERROR));
        }
        Ok(self.config.read_allowed)
    }

    fn read(&self) -> LinkResult<Option<Packet>> {
        self.hooks.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.hooks.read_error.load(Ordering::SeqCst) {
            return Err(LinkError::runtime(INJECTED_ERROR));
        }

        thread::sleep(self.config.interval);
        if !self.data_available.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let packet = self.generate_packet();
        self.counters.record_read(packet.len());
        Ok(Some(packet))
    }
}

impl Writable for SimLink {
    fn write(&self, packet: &Packet) -> LinkResult<()> {
        self.store_write(&packet.buffer)
    }

    fn write_raw(&self, data: &[u8]) -> LinkResult<()> {
        self.store_write(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_sim() -> SimLink {
        SimLink::new(
            SimConfig {
                interval: Duration::from_millis(5),
                target_name: Some("INST".to_string()),
                ..SimConfig::default()
            },
            FaultHooks::new(),
        )
    }

    #[test]
    fn test_read_produces_sequenced_packets() {
        let sim = quick_sim();
        sim.connect().unwrap();

        let first = sim.read().unwrap().unwrap();
        let second = sim.read().unwrap().unwrap();
        assert_eq!(first.len(), SIM_PACKET_SIZE);
        assert_eq!(&first.buffer[0..4], &0u32.to_be_bytes());
        assert_eq!(&second.buffer[0..4], &1u32.to_be_bytes());
        assert_eq!(first.target_name.as_deref(), Some("INST"));

        let counters = sim.counters();
        assert_eq!(counters.read_count, 2);
        assert_eq!(counters.bytes_read, 2 * SIM_PACKET_SIZE as u64);
    }

    #[test]
    fn test_read_after_disconnect_returns_none() {
        let sim = quick_sim();
        sim.connect().unwrap();
        sim.disconnect().unwrap();
        assert!(!sim.connected());
        assert!(sim.read().unwrap().is_none());
        assert_eq!(sim.hooks().disconnect_calls(), 1);
    }

    #[test]
    fn test_fault_hooks() {
        let sim = quick_sim();
        let hooks = Arc::clone(sim.hooks());

        hooks.fail_connect(true);
        let err = sim.connect().unwrap_err();
        assert_eq!(err.formatted(), "RuntimeError : test-error");
        assert!(!sim.connected());
        assert_eq!(hooks.connect_calls(), 1);

        hooks.fail_connect(false);
        sim.connect().unwrap();
        hooks.fail_read(true);
        assert!(sim.read().is_err());
        hooks.fail_read_allowed(true);
        assert!(sim.read_allowed().is_err());
        assert_eq!(hooks.read_calls(), 1);
    }

    #[test]
    fn test_write_requires_connection() {
        let sim = quick_sim();
        assert!(matches!(
            sim.write_raw(&[1, 2]),
            Err(LinkError::NotConnected(_))
        ));

        sim.connect().unwrap();
        sim.write(&Packet::new(vec![1, 2, 3])).unwrap();
        sim.write_raw(&[4]).unwrap();
        assert_eq!(sim.written(), vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(sim.counters().write_count, 2);
        assert_eq!(sim.counters().bytes_written, 4);

        sim.reset_counters();
        assert_eq!(sim.counters().write_count, 0);
    }
}
