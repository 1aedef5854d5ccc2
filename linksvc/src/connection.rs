//! Connection loop for linksvc
//!
//! One ConnectionLoop runs per microservice, on the thread that called
//! `LinkMicroservice::run()`. It is the only writer of the connection state.
//! The dispatch worker, the status publisher and external callers share the
//! LinkContext with it and talk to the loop through request flags and the
//! sleeper.
//!
//! ```text
//!            connect ok                read/monitor loss
//! ATTEMPTING ----------> CONNECTED ----------------------> ATTEMPTING
//!     |  ^                   |                                (auto_reconnect)
//!     |  | connect request   | disconnect request
//!     v  |                   v
//! DISCONNECTED <-------------+
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use linkgs::{
    ConnectionState, Counters, LinkError, LinkResult, MicroserviceIdentity, MicroserviceState,
    MicroserviceStatus, Packet, RelayError, RelayResult, StatusRecord, StatusStore, TelemetrySink,
};

use crate::config::LinkConfig;
use crate::endpoint::{Link, LinkEndpoint};
use crate::sleeper::Sleeper;

struct ServiceHealth {
    state: MicroserviceState,
    error: Option<String>,
}

/// State shared by the connection loop and the threads around it
pub struct LinkContext {
    identity: MicroserviceIdentity,
    endpoint: LinkEndpoint,
    config: LinkConfig,
    store: Arc<dyn StatusStore>,
    telemetry: Arc<dyn TelemetrySink>,
    queue_pending: Arc<AtomicUsize>,

    state: AtomicU8,
    /// Held around connect, disconnect and write. Never around read.
    link_lock: Mutex<()>,
    /// Orders status snapshots with their store writes
    publish_lock: Mutex<()>,
    /// Reconnect delays, monitor intervals and idle waits
    sleeper: Sleeper,
    /// Status heartbeat period
    status_sleeper: Sleeper,

    canceled: AtomicBool,
    disconnect_requested: AtomicBool,
    connect_requested: AtomicBool,
    loop_started: AtomicBool,
    loop_finished: AtomicBool,

    disconnects: AtomicU64,
    packets: AtomicU64,
    health: Mutex<ServiceHealth>,
}

impl LinkContext {
    pub fn new(
        identity: MicroserviceIdentity,
        endpoint: LinkEndpoint,
        config: LinkConfig,
        store: Arc<dyn StatusStore>,
        telemetry: Arc<dyn TelemetrySink>,
        queue_pending: Arc<AtomicUsize>,
    ) -> Self {
        let initial = if config.connect_on_startup {
            ConnectionState::Attempting
        } else {
            ConnectionState::Disconnected
        };

        Self {
            identity,
            endpoint,
            config,
            store,
            telemetry,
            queue_pending,
            state: AtomicU8::new(initial.to_u8()),
            link_lock: Mutex::new(()),
            publish_lock: Mutex::new(()),
            sleeper: Sleeper::new(),
            status_sleeper: Sleeper::new(),
            canceled: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            connect_requested: AtomicBool::new(false),
            loop_started: AtomicBool::new(false),
            loop_finished: AtomicBool::new(false),
            disconnects: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            health: Mutex::new(ServiceHealth {
                state: MicroserviceState::Initialized,
                error: None,
            }),
        }
    }

    /// Link name, used as the prefix of every log line
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn identity(&self) -> &MicroserviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &LinkEndpoint {
        &self.endpoint
    }

    pub fn link(&self) -> &dyn Link {
        self.endpoint.link()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
        self.publish_status();
    }

    pub(crate) fn lock_link(&self) -> MutexGuard<'_, ()> {
        self.link_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status_sleeper(&self) -> &Sleeper {
        &self.status_sleeper
    }

    /// Endpoint counters plus the command queue depth
    pub fn counters(&self) -> Counters {
        let mut counters = self.link().counters();
        counters.tx_queue_size = self.queue_pending.load(Ordering::SeqCst) as u64;
        counters
    }

    pub fn status_record(&self) -> StatusRecord {
        StatusRecord::from_counters(self.name(), self.state(), &self.counters()).with_timestamp()
    }

    /// Create the status record. Failure here stops construction.
    pub(crate) fn register(&self) -> RelayResult<()> {
        self.store
            .set_link_status(&self.identity.scope, self.identity.kind, &self.status_record())?;
        self.store
            .set_microservice_status(&self.identity.scope, &self.microservice_status())
    }

    /// Write the current status record. Store failures are logged only.
    pub fn publish_status(&self) {
        let _guard = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.status_record();
        if let Err(e) = self
            .store
            .set_link_status(&self.identity.scope, self.identity.kind, &record)
        {
            warn!("{}: Status update failed: {}", self.name(), e);
        }
    }

    pub fn microservice_status(&self) -> MicroserviceStatus {
        let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        MicroserviceStatus {
            name: self.identity.full_name(),
            state: health.state,
            count: self.packet_count(),
            error: health.error.clone(),
            updated_at: Some(chrono::Utc::now()),
        }
    }

    pub fn publish_microservice_status(&self) {
        let status = self.microservice_status();
        if let Err(e) = self
            .store
            .set_microservice_status(&self.identity.scope, &status)
        {
            warn!("{}: Microservice status update failed: {}", self.name(), e);
        }
    }

    fn set_health(&self, state: MicroserviceState, error: Option<String>) {
        {
            let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
            health.state = state;
            health.error = error;
        }
        self.publish_microservice_status();
    }

    /// Ask the loop to drop the link and stay down.
    ///
    /// Closes the endpoint from the calling thread, so this blocks for as long
    /// as the endpoint takes to disconnect. Does nothing once the loop ended.
    pub fn request_disconnect(&self) {
        if self.loop_finished() {
            return;
        }
        info!("{}: Disconnect requested", self.name());
        self.connect_requested.store(false, Ordering::SeqCst);
        self.disconnect_requested.store(true, Ordering::SeqCst);
        self.sleeper.wake();
        self.disconnect_endpoint();
    }

    /// Ask a disconnected loop to start attempting again.
    ///
    /// A request made while the link is up is dropped on the next successful
    /// connect or the next move to DISCONNECTED.
    pub fn request_connect(&self) {
        if self.loop_finished() {
            return;
        }
        info!("{}: Connect requested", self.name());
        self.disconnect_requested.store(false, Ordering::SeqCst);
        self.connect_requested.store(true, Ordering::SeqCst);
        self.sleeper.wake();
    }

    fn disconnect_pending(&self) -> bool {
        self.disconnect_requested.load(Ordering::SeqCst)
    }

    fn take_disconnect_request(&self) -> bool {
        self.disconnect_requested.swap(false, Ordering::SeqCst)
    }

    fn take_connect_request(&self) -> bool {
        self.connect_requested.swap(false, Ordering::SeqCst)
    }

    fn clear_connect_request(&self) {
        self.connect_requested.store(false, Ordering::SeqCst);
    }

    /// Close the endpoint if it is open
    pub(crate) fn disconnect_endpoint(&self) {
        let _guard = self.lock_link();
        if !self.link().connected() {
            return;
        }
        if let Err(e) = self.link().disconnect() {
            warn!("{}: Disconnect failed: {}", self.name(), e.formatted());
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    /// Run a write against the endpoint under the link lock.
    /// Returns the rejection reason on failure.
    pub(crate) fn write_with<F>(&self, write: F) -> Result<(), String>
    where
        F: FnOnce(&dyn Link) -> LinkResult<()>,
    {
        let result = {
            let _guard = self.lock_link();
            if !self.link().connected() {
                let reason = format!("{} not connected for write", self.name());
                warn!("{}: Write rejected: not connected", self.name());
                return Err(reason);
            }
            write(self.link())
        };

        self.publish_status();
        result.map_err(|e| {
            error!("{}: Write failed: {}", self.name(), e.formatted());
            e.to_string()
        })
    }

    /// Stop every loop. Sleeps in progress end at once.
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.sleeper.cancel();
        self.status_sleeper.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Claim the right to run the loop. Only the first caller gets it.
    pub(crate) fn claim_loop(&self) -> bool {
        !self.loop_started.swap(true, Ordering::SeqCst)
    }

    pub fn loop_finished(&self) -> bool {
        self.loop_finished.load(Ordering::SeqCst)
    }

    /// Endpoint disconnects performed so far
    pub fn disconnect_count(&self) -> u64 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Packets read and forwarded so far
    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::SeqCst)
    }

    fn forward_packet(&self, packet: &Packet) {
        self.packets.fetch_add(1, Ordering::SeqCst);
        self.telemetry.write_packet(&self.identity.scope, packet);
        self.publish_status();
    }
}

/// The reconnect state machine
pub struct ConnectionLoop {
    ctx: Arc<LinkContext>,
    /// Uncommon errors already reported in detail
    reported: HashSet<String>,
}

impl ConnectionLoop {
    pub fn new(ctx: Arc<LinkContext>) -> Self {
        Self {
            ctx,
            reported: HashSet::new(),
        }
    }

    /// Run until canceled or until a fatal error
    pub fn run(mut self) -> RelayResult<()> {
        let ctx = Arc::clone(&self.ctx);
        ctx.set_health(MicroserviceState::Running, None);

        let result = self.run_states();
        match &result {
            Ok(()) => {
                ctx.disconnect_endpoint();
                if ctx.state() != ConnectionState::Disconnected {
                    ctx.set_state(ConnectionState::Disconnected);
                }
                ctx.set_health(MicroserviceState::Finished, None);
            }
            Err(e) => {
                error!("{}: Fatal Exception! {}", ctx.name(), e.formatted());
                ctx.disconnect_endpoint();
                ctx.set_state(ConnectionState::Disconnected);
                ctx.set_health(MicroserviceState::DiedError, Some(e.formatted()));
            }
        }

        info!("{}: Stopped packet reading", ctx.name());
        ctx.loop_finished.store(true, Ordering::SeqCst);
        result.map_err(RelayError::from)
    }

    fn run_states(&mut self) -> LinkResult<()> {
        let ctx = Arc::clone(&self.ctx);
        if ctx.link().read_allowed()? {
            info!("{}: Starting packet reading", ctx.name());
        } else {
            info!("{}: Starting connection maintenance", ctx.name());
        }

        while !ctx.is_canceled() {
            match ctx.state() {
                ConnectionState::Attempting => self.attempt_connection()?,
                ConnectionState::Connected => self.maintain_connection()?,
                ConnectionState::Disconnected => self.wait_for_connect_request(),
            }
        }
        Ok(())
    }

    fn attempt_connection(&mut self) -> LinkResult<()> {
        let ctx = Arc::clone(&self.ctx);
        if ctx.take_disconnect_request() {
            info!("{}: Clean disconnect", ctx.name());
            ctx.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        let result = {
            let _guard = ctx.lock_link();
            if ctx.is_canceled() {
                return Ok(());
            }
            info!("{}: Connecting ...", ctx.name());
            ctx.link().connect()
        };

        match result {
            Ok(()) => {
                ctx.clear_connect_request();
                if ctx.config().reset_counters_on_connect {
                    ctx.link().reset_counters();
                }
                ctx.set_state(ConnectionState::Connected);
                info!("{}: Connection Success", ctx.name());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => self.handle_connection_failed(e),
        }
        Ok(())
    }

    fn maintain_connection(&mut self) -> LinkResult<()> {
        let ctx = Arc::clone(&self.ctx);
        if ctx.disconnect_pending() {
            self.handle_connection_lost(None);
            return Ok(());
        }

        if ctx.link().read_allowed()? {
            match ctx.link().read() {
                Ok(Some(packet)) => self.handle_packet(packet),
                _ if ctx.is_canceled() => {}
                Ok(None) => {
                    if !ctx.disconnect_pending() {
                        info!("{}: Internal disconnect requested (read returned no packet)", ctx.name());
                    }
                    self.handle_connection_lost(None);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.handle_connection_lost(Some(e)),
            }
        } else {
            if ctx.sleeper.sleep(ctx.config().monitor_interval()) {
                return Ok(());
            }
            if ctx.disconnect_pending() || !ctx.link().connected() {
                self.handle_connection_lost(None);
            }
        }
        Ok(())
    }

    fn wait_for_connect_request(&mut self) {
        let ctx = &self.ctx;
        if ctx.take_connect_request() {
            ctx.set_state(ConnectionState::Attempting);
            return;
        }
        ctx.sleeper.sleep(ctx.config().monitor_interval());
    }

    fn handle_packet(&mut self, mut packet: Packet) {
        packet.stamp();
        if packet.target_name.is_none() {
            if let [target] = self.ctx.identity().target_names.as_slice() {
                packet.target_name = Some(target.clone());
            }
        }
        self.ctx.forward_packet(&packet);
    }

    fn handle_connection_failed(&mut self, err: LinkError) {
        error!("{}: Connection Failed: {}", self.ctx.name(), err.formatted());
        self.report_uncommon(&err);
        self.disconnect(true);
    }

    fn handle_connection_lost(&mut self, err: Option<LinkError>) {
        let ctx = Arc::clone(&self.ctx);
        let clean = ctx.disconnect_pending();

        if clean {
            info!("{}: Clean disconnect", ctx.name());
            if let Some(e) = &err {
                debug!("{}: Read ended with {}", ctx.name(), e.formatted());
            }
            info!("{}: Connection Lost", ctx.name());
        } else {
            match &err {
                Some(e) => {
                    info!("{}: Connection Lost: {}", ctx.name(), e.formatted());
                    self.report_uncommon(e);
                }
                None => info!("{}: Connection Lost", ctx.name()),
            }
        }

        self.disconnect(!clean);
    }

    fn disconnect(&mut self, allow_reconnect: bool) {
        let ctx = &self.ctx;
        ctx.disconnect_endpoint();
        if ctx.is_canceled() {
            return;
        }

        if allow_reconnect && ctx.config().auto_reconnect && !ctx.disconnect_pending() {
            ctx.set_state(ConnectionState::Attempting);
            ctx.sleeper.sleep(ctx.config().reconnect_delay());
        } else {
            ctx.take_disconnect_request();
            ctx.clear_connect_request();
            ctx.set_state(ConnectionState::Disconnected);
        }
    }

    /// Log the full detail of an unexpected error, once per distinct error
    fn report_uncommon(&mut self, err: &LinkError) {
        if err.is_common() {
            return;
        }
        if self.reported.insert(err.formatted()) {
            error!("{}: Unexpected error detail: {:?}", self.ctx.name(), err);
        }
    }
}
