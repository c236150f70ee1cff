//! Sending batches of pings and handing them to the upload worker.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::boundary::{EngineBoundary, Handle};
use crate::coordinator::Coordinator;
use crate::dispatcher::Completion;
use crate::models::PingType;
use crate::upload::UploadScheduler;

/// Something the engine can be asked to send: a typed ping or a bare name.
pub trait SendablePing: Send + 'static {
    /// Ask the engine to assemble and queue the ping. Returns whether the
    /// ping had content.
    fn send(&self, engine: &dyn EngineBoundary, handle: Handle, log_ping: bool) -> bool;

    fn display_name(&self) -> &str;
}

impl SendablePing for PingType {
    fn send(&self, engine: &dyn EngineBoundary, handle: Handle, log_ping: bool) -> bool {
        engine.send_ping(handle, self, log_ping)
    }

    fn display_name(&self) -> &str {
        self.name()
    }
}

impl SendablePing for String {
    fn send(&self, engine: &dyn EngineBoundary, handle: Handle, log_ping: bool) -> bool {
        engine.send_ping_by_name(handle, self, log_ping)
    }

    fn display_name(&self) -> &str {
        self
    }
}

/// Send every ping in order, then enqueue the upload worker once if any of
/// them had content. Returns whether anything was sent.
pub(crate) fn send_batch<P: SendablePing>(
    engine: &dyn EngineBoundary,
    handle: Handle,
    pings: &[P],
    log_pings: bool,
    uploader: &dyn UploadScheduler,
) -> bool {
    let mut any_sent = false;
    for ping in pings {
        if ping.send(engine, handle, log_pings) {
            info!(ping = ping.display_name(), "Ping queued for upload");
            any_sent = true;
        } else {
            info!(ping = ping.display_name(), "Ping contained no data, not sending");
        }
    }

    if any_sent {
        uploader.enqueue();
    }
    any_sent
}

impl Coordinator {
    /// Send a batch of typed pings.
    ///
    /// Returns `None` without touching the engine when the client is not
    /// initialized, upload is disabled, or `pings` is empty.
    pub fn send_pings(&self, pings: Vec<PingType>) -> Option<Completion> {
        self.dispatch_send(pings)
    }

    /// Send a batch of pings known only by their registered names.
    pub fn send_pings_by_name<I, S>(&self, names: I) -> Option<Completion>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dispatch_send(names.into_iter().map(Into::into).collect::<Vec<String>>())
    }

    fn dispatch_send<P: SendablePing>(&self, pings: Vec<P>) -> Option<Completion> {
        let ready = match self.ready_state() {
            Some(ready) if self.is_initialized() => ready,
            _ => {
                error!("Pings can't be sent before initialize");
                return None;
            }
        };

        if !self.get_upload_enabled() {
            error!("Upload is disabled, not sending pings");
            return None;
        }

        if pings.is_empty() {
            debug!("No pings to send");
            return None;
        }

        let log_pings = ready.config.log_pings;
        let slot = self.slot.clone();
        let uploader = Arc::clone(&self.uploader);
        Some(self.dispatcher.launch(move || {
            slot.with_live(|engine, handle| send_batch(engine, handle, &pings, log_pings, &*uploader));
        }))
    }
}

impl Coordinator {
    /// Assemble `ping` as the engine would send it right now, without
    /// sending it. `None` when there is no engine or nothing to send.
    pub fn test_collect(&self, ping: &PingType) -> Option<String> {
        self.test_sync();
        self.slot
            .with_live(|engine, handle| engine.collect_ping(handle, ping))
            .flatten()
    }
}

impl PingType {
    /// Send this ping alone.
    pub fn submit(&self, coordinator: &Coordinator) -> Option<Completion> {
        coordinator.send_pings(vec![self.clone()])
    }
}
