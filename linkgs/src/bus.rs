//! In-process message bus
//!
//! Topics carry commands toward interfaces, telemetry toward routers and
//! control requests toward a single link. Each subscription owns one bounded
//! queue; a full queue rejects new messages instead of growing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::types::{MicroserviceKind, Packet, NAME_SEPARATOR};

/// Target name used for packets nobody identified
pub const UNKNOWN_TARGET: &str = "UNKNOWN";

/// Topic carrying commands for a target: `SCOPE__CMD}TARGET`
pub fn command_topic(scope: &str, target_name: &str) -> String {
    format!("{}{}CMD}}{}", scope, NAME_SEPARATOR, target_name)
}

/// Topic carrying telemetry of a target: `SCOPE__TELEMETRY__TARGET`
pub fn telemetry_topic(scope: &str, target_name: &str) -> String {
    format!("{scope}{sep}TELEMETRY{sep}{target_name}", sep = NAME_SEPARATOR)
}

/// Topic carrying control requests for one link: `SCOPE__CMD}KIND__NAME`
pub fn control_topic(scope: &str, kind: MicroserviceKind, name: &str) -> String {
    format!("{scope}{sep}CMD}}{kind}{sep}{name}", sep = NAME_SEPARATOR)
}

/// Message delivered to a link's dispatch worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Opaque command bytes for a target
    Command { target_name: String, payload: Vec<u8> },
    /// Already decoded telemetry to redistribute
    Telemetry(Packet),
    /// Bytes written to the link without any processing
    WriteRaw(Vec<u8>),
    /// Move a disconnected link back to attempting
    Connect,
    /// Operator requested disconnect
    Disconnect,
    /// Stop the dispatch worker
    Shutdown,
}

/// Reply to a bus message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandAck {
    Success,
    Rejected(String),
}

impl CommandAck {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandAck::Success)
    }
}

/// A message plus the channel its reply goes back on
#[derive(Debug)]
pub struct BusEnvelope {
    pub topic: String,
    pub message: BusMessage,
    reply: Option<SyncSender<CommandAck>>,
}

impl BusEnvelope {
    /// Send the reply. Publishers that stopped waiting are ignored.
    pub fn ack(&mut self, ack: CommandAck) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.try_send(ack);
        }
    }
}

/// Receiving side of a published message's reply
pub struct AckReceiver {
    receiver: Receiver<CommandAck>,
}

impl AckReceiver {
    /// Wait for the reply
    pub fn wait(&self, timeout: Duration) -> RelayResult<CommandAck> {
        match self.receiver.recv_timeout(timeout) {
            Ok(ack) => Ok(ack),
            Err(RecvTimeoutError::Timeout) => Err(RelayError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(RelayError::bus("Message dropped without a reply"))
            }
        }
    }
}

struct Route {
    subscription_id: u64,
    sender: SyncSender<BusEnvelope>,
    pending: Arc<AtomicUsize>,
}

/// Consumer end of one or more topics
pub struct Subscription {
    id: u64,
    topics: Vec<String>,
    receiver: Receiver<BusEnvelope>,
    pending: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Messages queued and not yet received
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Shared handle on the pending count, for status reporting
    pub fn pending_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.pending)
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` on timeout and an error once the bus dropped every
    /// route to this subscription.
    pub fn recv_timeout(&self, timeout: Duration) -> RelayResult<Option<BusEnvelope>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(envelope))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RelayError::bus("Subscription closed")),
        }
    }
}

/// Topic-routed bus with bounded per-subscription queues
pub struct MessageBus {
    routes: Mutex<HashMap<String, Vec<Route>>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to a set of topics through a single queue
    pub fn subscribe(&self, topics: &[String]) -> RelayResult<Subscription> {
        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        let pending = Arc::new(AtomicUsize::new(0));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut routes = self.routes.lock().map_err(|_| RelayError::bus("Lock poisoned"))?;
        for topic in topics {
            debug!("Subscription {} added to topic {}", id, topic);
            routes.entry(topic.clone()).or_default().push(Route {
                subscription_id: id,
                sender: sender.clone(),
                pending: Arc::clone(&pending),
            });
        }

        Ok(Subscription {
            id,
            topics: topics.to_vec(),
            receiver,
            pending,
        })
    }

    /// Remove every route to a subscription. Its receiver then reports closed.
    pub fn unsubscribe(&self, subscription_id: u64) -> RelayResult<()> {
        let mut routes = self.routes.lock().map_err(|_| RelayError::bus("Lock poisoned"))?;
        for list in routes.values_mut() {
            list.retain(|r| r.subscription_id != subscription_id);
        }
        routes.retain(|_, list| !list.is_empty());
        Ok(())
    }

    /// Deliver a message to the first subscriber of a topic and hand back the
    /// receiver for its reply
    pub fn publish(&self, topic: &str, message: BusMessage) -> RelayResult<AckReceiver> {
        let routes = self.routes.lock().map_err(|_| RelayError::bus("Lock poisoned"))?;
        let route = routes
            .get(topic)
            .and_then(|list| list.first())
            .ok_or_else(|| RelayError::bus(format!("No subscriber for topic {}", topic)))?;

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let envelope = BusEnvelope {
            topic: topic.to_string(),
            message,
            reply: Some(reply_tx),
        };

        route.pending.fetch_add(1, Ordering::SeqCst);
        match route.sender.try_send(envelope) {
            Ok(()) => Ok(AckReceiver { receiver: reply_rx }),
            Err(TrySendError::Full(_)) => {
                route.pending.fetch_sub(1, Ordering::SeqCst);
                Err(RelayError::bus(format!("Queue full for topic {}", topic)))
            }
            Err(TrySendError::Disconnected(_)) => {
                route.pending.fetch_sub(1, Ordering::SeqCst);
                Err(RelayError::bus(format!("Subscriber of topic {} is gone", topic)))
            }
        }
    }

    /// Deliver a message to every subscriber of a topic without replies.
    /// Full queues drop the message. Returns the number of deliveries.
    pub fn broadcast(&self, topic: &str, message: &BusMessage) -> usize {
        let routes = match self.routes.lock() {
            Ok(routes) => routes,
            Err(_) => return 0,
        };
        let Some(list) = routes.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for route in list {
            let envelope = BusEnvelope {
                topic: topic.to_string(),
                message: message.clone(),
                reply: None,
            };
            route.pending.fetch_add(1, Ordering::SeqCst);
            if route.sender.try_send(envelope).is_ok() {
                delivered += 1;
            } else {
                route.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        delivered
    }

    /// Send opaque command bytes to whichever interface serves the target
    pub fn send_command(&self, scope: &str, target_name: &str, payload: Vec<u8>) -> RelayResult<AckReceiver> {
        self.publish(
            &command_topic(scope, target_name),
            BusMessage::Command {
                target_name: target_name.to_string(),
                payload,
            },
        )
    }

    /// Send a control request to one link
    pub fn control(&self, scope: &str, kind: MicroserviceKind, name: &str, message: BusMessage) -> RelayResult<AckReceiver> {
        self.publish(&control_topic(scope, kind, name), message)
    }
}

/// Consumer of telemetry read from an interface
pub trait TelemetrySink: Send + Sync {
    fn write_packet(&self, scope: &str, packet: &Packet);
}

impl TelemetrySink for MessageBus {
    fn write_packet(&self, scope: &str, packet: &Packet) {
        let target = packet.target_name.as_deref().unwrap_or(UNKNOWN_TARGET);
        let topic = telemetry_topic(scope, target);
        let delivered = self.broadcast(&topic, &BusMessage::Telemetry(packet.clone()));
        debug!("Telemetry on {} delivered to {} subscribers", topic, delivered);
    }
}
