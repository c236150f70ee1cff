//! Ping-type registration, including the queue of registrations made before
//! the engine exists.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::coordinator::{lock, Coordinator};
use crate::models::PingType;

/// FIFO of ping types waiting for the engine.
///
/// `initialize` drains it under the same lock `register_ping_type` takes, so
/// a registration is either queued before the flush or forwarded after it.
#[derive(Debug, Default)]
pub(crate) struct PingRegistry {
    queue: Mutex<Vec<PingType>>,
}

impl PingRegistry {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<PingType>> {
        lock(&self.queue)
    }
}

impl Coordinator {
    /// Register a ping type with the engine, or queue it until `initialize`.
    ///
    /// Duplicates are not filtered.
    pub fn register_ping_type(&self, ping: &PingType) {
        let mut queue = self.registry.lock();
        if !self.is_initialized() {
            debug!(ping = ping.name(), "Queueing ping type until initialize");
            queue.push(ping.clone());
            return;
        }

        let slot = self.slot.clone();
        let ping = ping.clone();
        let _ = self.dispatcher.launch(move || {
            slot.with_live(|engine, handle| engine.register_ping_type(handle, &ping));
        });
    }

    /// Names of the ping types still queued for registration, in order.
    ///
    /// The queue is only kept after init while testing mode is on.
    pub fn test_queued_ping_types(&self) -> Vec<String> {
        self.registry
            .lock()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Whether the engine knows a ping type called `name`.
    pub fn test_has_ping_type(&self, name: &str) -> bool {
        self.test_sync();
        self.slot
            .with_live(|engine, handle| engine.has_ping_type(handle, name))
            .unwrap_or(false)
    }
}
