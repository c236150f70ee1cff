//! The handle-based boundary to the collection/storage engine.
//!
//! The coordinator never touches engine state directly: everything goes
//! through these calls, keyed by the integer handle `create` returned.

use std::path::Path;

use crate::models::{ClientInfo, PingType};

/// Engine handle. `0` means "no engine".
pub type Handle = u64;

/// Sentinel for "no engine".
pub const NO_HANDLE: Handle = 0;

pub trait EngineBoundary: Send + Sync + 'static {
    /// Create an engine storing its data under `data_dir`. Returns
    /// [`NO_HANDLE`] if the engine cannot start.
    ///
    /// `max_events` caps the staged entries assembled into a single ping.
    /// When upload was enabled in the persisted state and `upload_enabled`
    /// is false, the engine clears its data and queues a deletion-request
    /// ping.
    fn create(
        &self,
        data_dir: &Path,
        application_id: &str,
        upload_enabled: bool,
        max_events: Option<usize>,
    ) -> Handle;

    fn destroy(&self, handle: Handle);

    /// Turning upload off clears collected data. Returns whether that
    /// queued a deletion-request ping (only on an enabled to disabled flip).
    fn set_upload_enabled(&self, handle: Handle, enabled: bool) -> bool;

    fn is_upload_enabled(&self, handle: Handle) -> bool;

    /// `keys[i]` pairs with `values[i]`.
    fn set_experiment_active(
        &self,
        handle: Handle,
        experiment_id: &str,
        branch: &str,
        keys: &[String],
        values: &[String],
    );

    fn set_experiment_inactive(&self, handle: Handle, experiment_id: &str);

    /// JSON-encoded `{"branch": .., "extra": {..}}`, or `None` if the
    /// experiment is not active.
    fn experiment_data(&self, handle: Handle, experiment_id: &str) -> Option<String>;

    /// Assemble a ping payload without sending it.
    fn collect_ping(&self, handle: Handle, ping: &PingType) -> Option<String>;

    /// Assemble and queue a ping. Returns whether the ping had content.
    fn send_ping(&self, handle: Handle, ping: &PingType, log_ping: bool) -> bool;

    /// Same as [`EngineBoundary::send_ping`], for a ping known only by name.
    fn send_ping_by_name(&self, handle: Handle, ping_name: &str, log_ping: bool) -> bool;

    fn register_ping_type(&self, handle: Handle, ping: &PingType);

    fn has_ping_type(&self, handle: Handle, ping_name: &str) -> bool;

    /// Let the engine process work it held back until the client was ready.
    /// Returns whether pings are waiting for the upload worker.
    fn signal_ready_to_send(&self, handle: Handle) -> bool;

    /// Record platform metadata into the engine's core metrics.
    fn record_client_info(&self, handle: Handle, info: &ClientInfo);
}
