//! Command dispatch worker
//!
//! Drains the link's bus subscription: commands for interfaces, telemetry for
//! routers and control requests for either. Writes go to the endpoint only
//! while it is connected, under the link lock.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use linkgs::{BusEnvelope, BusMessage, CommandAck, MicroserviceKind, Packet, Subscription};

use crate::connection::LinkContext;

pub struct CommandDispatcher {
    ctx: Arc<LinkContext>,
    subscription: Subscription,
}

impl CommandDispatcher {
    pub fn new(ctx: Arc<LinkContext>, subscription: Subscription) -> Self {
        Self { ctx, subscription }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("{}-dispatch", self.ctx.name()))
            .spawn(move || self.run())
    }

    fn run(self) {
        debug!(
            "{}: Dispatching from {} topics",
            self.ctx.name(),
            self.subscription.topics().len()
        );
        let poll = self.ctx.config().command_poll();

        while !self.ctx.is_canceled() {
            match self.subscription.recv_timeout(poll) {
                Ok(Some(envelope)) => {
                    if !self.handle(envelope) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("{}: {}", self.ctx.name(), e);
                    break;
                }
            }
        }
        debug!("{}: Dispatch worker stopped", self.ctx.name());
    }

    /// Handle one message. Returns false when the worker should stop.
    fn handle(&self, mut envelope: BusEnvelope) -> bool {
        let (ack, keep_running) = self.dispatch(&envelope.message);
        envelope.ack(ack);
        keep_running
    }

    fn dispatch(&self, message: &BusMessage) -> (CommandAck, bool) {
        let ctx = &self.ctx;
        let kind = ctx.endpoint().kind();

        let ack = match message {
            BusMessage::Shutdown => {
                info!("{}: Shutdown requested", ctx.name());
                return (CommandAck::Success, false);
            }
            BusMessage::Connect => {
                ctx.request_connect();
                CommandAck::Success
            }
            BusMessage::Disconnect => {
                ctx.request_disconnect();
                CommandAck::Success
            }
            BusMessage::WriteRaw(data) => {
                info!("{}: Write raw", ctx.name());
                to_ack(ctx.write_with(|link| link.write_raw(data)))
            }
            BusMessage::Command {
                target_name,
                payload,
            } if kind == MicroserviceKind::Interface => {
                let packet = Packet::for_target(target_name.clone(), payload.clone());
                to_ack(ctx.write_with(|link| link.write(&packet)))
            }
            BusMessage::Telemetry(packet) if kind == MicroserviceKind::Router => {
                to_ack(ctx.write_with(|link| link.write(packet)))
            }
            other => {
                warn!("{}: Ignoring {:?} on a {} link", ctx.name(), other, kind);
                CommandAck::Rejected(format!("{} links do not accept this message", kind))
            }
        };
        (ack, true)
    }
}

fn to_ack(result: Result<(), String>) -> CommandAck {
    match result {
        Ok(()) => CommandAck::Success,
        Err(reason) => CommandAck::Rejected(reason),
    }
}
