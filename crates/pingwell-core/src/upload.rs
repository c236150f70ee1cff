//! The hand-off to the upload worker.
//!
//! pingwell never uploads anything itself: once a send batch produced at
//! least one ping, the worker is enqueued and takes it from there.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::storage;

pub trait UploadScheduler: Send + Sync + 'static {
    /// Ask the upload worker to process pending pings.
    fn enqueue(&self);
}

/// Scheduler that reports what an upload worker would pick up from a data
/// directory written by [`crate::FileEngine`].
#[derive(Debug, Clone)]
pub struct PendingPingsScheduler {
    data_dir: PathBuf,
    endpoint: String,
}

pub const DEFAULT_SERVER_ENDPOINT: &str = "https://incoming.telemetry.example.org";

impl PendingPingsScheduler {
    pub fn new(data_dir: impl Into<PathBuf>, endpoint: Option<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_SERVER_ENDPOINT.to_string()),
        }
    }
}

impl UploadScheduler for PendingPingsScheduler {
    fn enqueue(&self) {
        match storage::list_pending_pings(&self.data_dir) {
            Ok(pending) => info!(
                pending = pending.len(),
                endpoint = %self.endpoint,
                "Upload worker enqueued"
            ),
            Err(e) => warn!("Upload worker enqueued, but pending pings are unreadable: {}", e),
        }
    }
}

/// Scheduler that only counts how often it was enqueued.
#[derive(Debug, Default)]
pub struct CountingScheduler {
    count: AtomicUsize,
}

impl CountingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl UploadScheduler for CountingScheduler {
    fn enqueue(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
