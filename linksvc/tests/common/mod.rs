//! Shared helpers for the linksvc integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{LevelFilter, Log, Metadata, Record};

use linkgs::{
    ConnectionState, MemoryStatusStore, MessageBus, MicroserviceKind, RelayResult, StatusStore,
};
use linksvc_lib::{
    FaultHooks, LinkConfig, LinkEndpoint, LinkMicroservice, LinkServices, SimConfig, SimLink,
};

pub const SCOPE: &str = "TEST";

/// Logger keeping every formatted message in memory
struct CaptureLogger {
    lines: Mutex<Vec<String>>,
}

static LOGGER: CaptureLogger = CaptureLogger {
    lines: Mutex::new(Vec::new()),
};
static INIT: Once = Once::new();

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push(format!("{}", record.args()));
    }

    fn flush(&self) {}
}

fn init_logging() {
    INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Debug);
    });
}

fn all_lines() -> Vec<String> {
    LOGGER.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// View of the captured log restricted to one link's lines.
/// Tests run in parallel, so every test uses its own link name.
pub struct LogCapture {
    prefix: String,
    start: usize,
}

impl LogCapture {
    pub fn new(link_name: &str) -> Self {
        init_logging();
        Self {
            prefix: format!("{}: ", link_name),
            start: all_lines().len(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        all_lines()
            .into_iter()
            .skip(self.start)
            .filter(|line| line.starts_with(&self.prefix))
            .collect()
    }

    pub fn contains(&self, text: &str) -> bool {
        self.lines().iter().any(|line| line.contains(text))
    }

    pub fn count(&self, text: &str) -> usize {
        self.lines().iter().filter(|line| line.contains(text)).count()
    }

    /// Index of the first line containing `text`
    pub fn position(&self, text: &str) -> Option<usize> {
        self.lines().iter().position(|line| line.contains(text))
    }

    /// Forget everything captured so far
    pub fn clear(&mut self) {
        self.start = all_lines().len();
    }
}

/// Poll `condition` every few milliseconds until it holds or time runs out
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Quick timings for tests. Individual tests override what they check.
pub fn test_link_config() -> LinkConfig {
    LinkConfig {
        reconnect_delay_ms: 100,
        status_period_ms: 50,
        monitor_interval_ms: 1000,
        command_poll_ms: 20,
        join_timeout_ms: 1000,
        ..LinkConfig::default()
    }
}

/// A microservice over a simulated link plus everything needed to poke it
pub struct Harness {
    pub name: String,
    pub kind: MicroserviceKind,
    pub service: Arc<LinkMicroservice>,
    pub sim: Arc<SimLink>,
    pub hooks: Arc<FaultHooks>,
    pub store: Arc<MemoryStatusStore>,
    pub bus: Arc<MessageBus>,
    pub log: LogCapture,
}

impl Harness {
    pub fn interface(name: &str, config: LinkConfig) -> Self {
        Self::build(MicroserviceKind::Interface, name, config, SimConfig::default(), None)
    }

    pub fn build(
        kind: MicroserviceKind,
        name: &str,
        config: LinkConfig,
        sim_config: SimConfig,
        bus: Option<Arc<MessageBus>>,
    ) -> Self {
        let log = LogCapture::new(name);
        let hooks = FaultHooks::new();
        let sim = Arc::new(SimLink::new(sim_config, Arc::clone(&hooks)));
        let store = Arc::new(MemoryStatusStore::new());
        let bus = bus.unwrap_or_else(|| Arc::new(MessageBus::new(16)));

        let service = LinkMicroservice::new(
            &format!("{}__{}__{}", SCOPE, kind, name),
            vec!["INST".to_string()],
            LinkEndpoint::new(kind, sim.clone()),
            config,
            LinkServices {
                store: store.clone(),
                bus: Arc::clone(&bus),
            },
        )
        .expect("microservice construction");

        Self {
            name: name.to_string(),
            kind,
            service: Arc::new(service),
            sim,
            hooks,
            store,
            bus,
            log,
        }
    }

    /// Run the connection loop on its own thread
    pub fn start(&self) -> JoinHandle<RelayResult<()>> {
        let service = Arc::clone(&self.service);
        thread::spawn(move || service.run())
    }

    /// Connection state as published in the status store
    pub fn published_state(&self) -> Option<ConnectionState> {
        self.store
            .link_status(SCOPE, self.kind, &self.name)
            .ok()
            .flatten()
            .map(|record| record.state)
    }

    pub fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        wait_until(timeout, || self.published_state() == Some(state))
    }

    /// Send a control message without waiting for the reply
    pub fn send_control(&self, message: linkgs::BusMessage) {
        self.bus
            .control(SCOPE, self.kind, &self.name, message)
            .expect("control message queued");
    }
}
