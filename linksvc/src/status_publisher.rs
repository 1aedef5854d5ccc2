//! Status heartbeat
//!
//! Rewrites the link status record and the microservice heartbeat every
//! status period so observers see fresh counters even when nothing changes
//! state.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::connection::LinkContext;

pub struct StatusPublisher {
    ctx: Arc<LinkContext>,
}

impl StatusPublisher {
    pub fn new(ctx: Arc<LinkContext>) -> Self {
        Self { ctx }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("{}-status", self.ctx.name()))
            .spawn(move || self.run())
    }

    fn run(self) {
        let period = self.ctx.config().status_period();
        loop {
            if self.ctx.is_canceled() {
                break;
            }
            self.ctx.publish_status();
            self.ctx.publish_microservice_status();
            if self.ctx.status_sleeper().sleep(period) {
                break;
            }
        }
        debug!("{}: Status publisher stopped", self.ctx.name());
    }
}
