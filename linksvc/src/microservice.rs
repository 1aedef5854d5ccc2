//! Lifecycle of a connection microservice
//!
//! Construction registers the status record and starts two helper threads:
//! the status publisher and the command dispatch worker. `run()` drives the
//! connection loop on the caller's thread. `shutdown()` stops everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use linkgs::{
    command_topic, control_topic, telemetry_topic, BusMessage, ConnectionState, MessageBus,
    MicroserviceIdentity, MicroserviceKind, MicroserviceStatus, RelayError, RelayResult,
    StatusRecord, StatusStore,
};

use crate::config::LinkConfig;
use crate::connection::{ConnectionLoop, LinkContext};
use crate::dispatch::CommandDispatcher;
use crate::endpoint::LinkEndpoint;
use crate::status_publisher::StatusPublisher;

const JOIN_POLL: Duration = Duration::from_millis(5);

/// Shared services a microservice publishes to
#[derive(Clone)]
pub struct LinkServices {
    pub store: Arc<dyn StatusStore>,
    pub bus: Arc<MessageBus>,
}

pub struct LinkMicroservice {
    ctx: Arc<LinkContext>,
    bus: Arc<MessageBus>,
    subscription_id: u64,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl LinkMicroservice {
    /// Create a microservice named `SCOPE__KIND__NAME`.
    ///
    /// The endpoint's role must match the kind in the name.
    pub fn new(
        full_name: &str,
        target_names: Vec<String>,
        endpoint: LinkEndpoint,
        config: LinkConfig,
        services: LinkServices,
    ) -> RelayResult<Self> {
        let identity = MicroserviceIdentity::parse(full_name, target_names)?;
        if endpoint.kind() != identity.kind {
            return Err(RelayError::configuration(format!(
                "{} needs an {} endpoint, got {}",
                full_name,
                identity.kind,
                endpoint.kind()
            )));
        }
        config.validate()?;

        let topics = subscription_topics(&identity);
        let subscription = services.bus.subscribe(&topics)?;
        let subscription_id = subscription.id();

        let ctx = Arc::new(LinkContext::new(
            identity,
            endpoint,
            config,
            Arc::clone(&services.store),
            services.bus.clone(),
            subscription.pending_counter(),
        ));
        if let Err(e) = ctx.register() {
            let _ = services.bus.unsubscribe(subscription_id);
            return Err(e);
        }

        let mut threads = Vec::with_capacity(2);
        let spawned = StatusPublisher::new(Arc::clone(&ctx))
            .spawn()
            .and_then(|handle| {
                threads.push(handle);
                CommandDispatcher::new(Arc::clone(&ctx), subscription).spawn()
            });

        let microservice = Self {
            ctx,
            bus: services.bus,
            subscription_id,
            threads: Mutex::new(threads),
            shut_down: AtomicBool::new(false),
        };

        match spawned {
            Ok(handle) => {
                microservice.threads_guard().push(handle);
                info!(
                    "{}: Microservice {} initialized in state {}",
                    microservice.ctx.name(),
                    microservice.ctx.identity(),
                    microservice.ctx.state()
                );
                Ok(microservice)
            }
            Err(e) => {
                microservice.shutdown();
                Err(RelayError::Io(e))
            }
        }
    }

    /// Run the connection loop until shutdown or a fatal endpoint error
    pub fn run(&self) -> RelayResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RelayError::invalid_state("Microservice is shut down"));
        }
        if !self.ctx.claim_loop() {
            return Err(RelayError::invalid_state("Connection loop already started"));
        }
        ConnectionLoop::new(Arc::clone(&self.ctx)).run()
    }

    /// Request a connection from a disconnected link
    pub fn connect(&self) {
        self.ctx.request_connect();
    }

    /// Request a clean disconnect. Blocks while the endpoint closes.
    pub fn disconnect(&self) {
        self.ctx.request_disconnect();
    }

    /// Stop the loop and the helper threads. Safe to call more than once and
    /// from any thread.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: Shutting down", self.ctx.name());

        self.ctx.cancel();
        if let Err(e) = self.bus.unsubscribe(self.subscription_id) {
            warn!("{}: Unsubscribe failed: {}", self.ctx.name(), e);
        }
        // Ends a read the loop may be blocked in
        self.ctx.disconnect_endpoint();

        self.join_threads();
        self.ctx.publish_status();
        self.ctx.publish_microservice_status();
    }

    fn join_threads(&self) {
        let handles: Vec<JoinHandle<()>> = self.threads_guard().drain(..).collect();
        let deadline = Instant::now() + self.ctx.config().join_timeout();

        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if !handle.is_finished() {
                warn!("{}: Thread {} did not stop in time", self.ctx.name(), name);
                continue;
            }
            if handle.join().is_err() {
                warn!("{}: Thread {} panicked", self.ctx.name(), name);
            } else {
                debug!("{}: Thread {} joined", self.ctx.name(), name);
            }
        }
    }

    fn threads_guard(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Helper threads still running
    pub fn background_threads(&self) -> usize {
        self.threads_guard()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn identity(&self) -> &MicroserviceIdentity {
        self.ctx.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.state()
    }

    pub fn status(&self) -> StatusRecord {
        self.ctx.status_record()
    }

    pub fn microservice_status(&self) -> MicroserviceStatus {
        self.ctx.microservice_status()
    }

    pub fn disconnect_count(&self) -> u64 {
        self.ctx.disconnect_count()
    }

    pub fn packet_count(&self) -> u64 {
        self.ctx.packet_count()
    }

    /// True once the connection loop has returned
    pub fn is_finished(&self) -> bool {
        self.ctx.loop_finished()
    }
}

impl Drop for LinkMicroservice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Topics the dispatch worker listens on
fn subscription_topics(identity: &MicroserviceIdentity) -> Vec<String> {
    let mut topics = vec![control_topic(&identity.scope, identity.kind, &identity.name)];
    for target in &identity.target_names {
        topics.push(match identity.kind {
            MicroserviceKind::Interface => command_topic(&identity.scope, target),
            MicroserviceKind::Router => telemetry_topic(&identity.scope, target),
        });
    }
    topics
}
