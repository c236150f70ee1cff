//! The client coordinator: engine lifecycle and upload-enabled state.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──initialize──▶ Initialized ──test_destroy──▶ Uninitialized
//! ```
//!
//! The engine handle is the only lifecycle state. It is written under the
//! lifecycle lock and read lock-free everywhere else; a stale read is
//! treated as "not ready yet". `initialize` publishes it only after every
//! init side effect has reached the engine, so anything dispatched by a
//! caller that saw the handle lands after them. Every other mutation goes
//! through the [`Dispatcher`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

use tracing::{debug, error, info, warn};

use crate::boundary::{EngineBoundary, Handle, NO_HANDLE};
use crate::dispatcher::{Completion, Dispatcher};
use crate::error::Result;
use crate::models::{ClientInfo, ClientInfoProvider, Configuration, InitContext, InitOutcome};
use crate::registry::PingRegistry;
use crate::upload::UploadScheduler;

/// Shared reference to the engine plus the live handle.
///
/// Dispatched operations capture a clone and read the handle when they run,
/// so an operation queued before `test_destroy` never reaches a dead engine.
#[derive(Clone)]
pub(crate) struct EngineSlot {
    engine: Arc<dyn EngineBoundary>,
    handle: Arc<AtomicU64>,
}

impl EngineSlot {
    fn new(engine: Arc<dyn EngineBoundary>) -> Self {
        Self {
            engine,
            handle: Arc::new(AtomicU64::new(NO_HANDLE)),
        }
    }

    pub(crate) fn engine(&self) -> &dyn EngineBoundary {
        &*self.engine
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle.load(Ordering::SeqCst)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.handle() != NO_HANDLE
    }

    fn publish(&self, handle: Handle) {
        self.handle.store(handle, Ordering::SeqCst);
    }

    fn take(&self) -> Handle {
        self.handle.swap(NO_HANDLE, Ordering::SeqCst)
    }

    /// Run `f` against the live engine. `None` if there is no engine.
    pub(crate) fn with_live<R>(&self, f: impl FnOnce(&dyn EngineBoundary, Handle) -> R) -> Option<R> {
        match self.handle() {
            NO_HANDLE => {
                debug!("No live engine, skipping");
                None
            }
            handle => Some(f(self.engine(), handle)),
        }
    }
}

/// State that exists only while initialized.
pub(crate) struct ReadyState {
    pub(crate) config: Arc<Configuration>,
    pub(crate) client_info: ClientInfo,
}

/// Explicit context object for one telemetry client.
///
/// Hosts usually create one per process at startup and pass it by reference.
pub struct Coordinator {
    pub(crate) slot: EngineSlot,
    pub(crate) uploader: Arc<dyn UploadScheduler>,
    client_info: Arc<dyn ClientInfoProvider>,
    pub(crate) dispatcher: Dispatcher,
    lifecycle: Mutex<()>,
    pub(crate) ready: Arc<RwLock<Option<Arc<ReadyState>>>>,
    pending_upload_enabled: Mutex<Option<bool>>,
    pub(crate) registry: PingRegistry,
    background_pings: Mutex<Option<Vec<String>>>,
}

impl Coordinator {
    /// Create an uninitialized coordinator and start its dispatcher.
    pub fn new(
        engine: Arc<dyn EngineBoundary>,
        uploader: Arc<dyn UploadScheduler>,
        client_info: Arc<dyn ClientInfoProvider>,
    ) -> Result<Self> {
        Ok(Self {
            slot: EngineSlot::new(engine),
            uploader,
            client_info,
            dispatcher: Dispatcher::new()?,
            lifecycle: Mutex::new(()),
            ready: Arc::new(RwLock::new(None)),
            pending_upload_enabled: Mutex::new(None),
            registry: PingRegistry::default(),
            background_pings: Mutex::new(None),
        })
    }

    /// Create the engine and run every init side effect, at most once.
    ///
    /// Usage errors are logged and reported through [`InitOutcome`]; an
    /// engine that refuses to start leaves the client uninitialized. The only
    /// error returned is missing required client info, in which case the
    /// engine just created is torn down again.
    pub fn initialize(&self, context: &InitContext, configuration: Configuration) -> Result<InitOutcome> {
        let _guard = match self.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                error!("initialize called while another initialization is running");
                return Ok(InitOutcome::InProgress);
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        if !context.is_main_process() {
            error!(
                process = %context.process_name,
                "initialize must be called from the main process"
            );
            return Ok(InitOutcome::NotMainProcess);
        }

        if self.is_initialized() {
            error!("initialize called more than once, ignoring");
            return Ok(InitOutcome::AlreadyInitialized);
        }

        // Registrations and upload flag changes wait here until the handle
        // is published.
        let mut queue = self.registry.lock();

        let data_dir = context.data_dir(&configuration);
        let application_id = context.application_id();
        let upload_enabled = self
            .pending_upload_enabled()
            .unwrap_or(configuration.upload_enabled);

        let engine = self.slot.engine();
        let handle = engine.create(
            &data_dir,
            &application_id,
            upload_enabled,
            configuration.max_events,
        );
        if handle == NO_HANDLE {
            warn!(
                data_dir = %data_dir.display(),
                "Engine failed to start, client stays uninitialized"
            );
            return Ok(InitOutcome::EngineUnavailable);
        }

        let client_info = match ClientInfo::collect(&*self.client_info, configuration.channel.as_deref()) {
            Ok(info) => info,
            Err(e) => {
                error!("Aborting initialization: {}", e);
                engine.destroy(handle);
                return Err(e);
            }
        };

        let configuration = Arc::new(configuration);
        let ready = Arc::new(ReadyState {
            config: Arc::clone(&configuration),
            client_info,
        });
        for ping in queue.iter() {
            engine.register_ping_type(handle, ping);
        }
        debug!(count = queue.len(), "Registered queued ping types");
        if !self.dispatcher.testing_mode() {
            queue.clear();
        }

        engine.record_client_info(handle, &ready.client_info);
        let pings_waiting = engine.signal_ready_to_send(handle);

        *lock(&self.background_pings) = Some(configuration.background_pings.clone());
        *write(&self.ready) = Some(ready);
        self.slot.publish(handle);
        drop(queue);

        if pings_waiting {
            self.uploader.enqueue();
        }

        info!(
            application_id = %application_id,
            data_dir = %data_dir.display(),
            upload_enabled,
            "Telemetry client initialized"
        );
        Ok(InitOutcome::Initialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.is_ready()
    }

    /// The configuration `initialize` was given, while initialized.
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.ready_state().map(|r| Arc::clone(&r.config))
    }

    pub(crate) fn ready_state(&self) -> Option<Arc<ReadyState>> {
        read(&self.ready).clone()
    }

    fn pending_upload_enabled(&self) -> Option<bool> {
        *lock(&self.pending_upload_enabled)
    }

    /// Enable or disable upload.
    ///
    /// Before init the value is remembered and handed to the engine at
    /// creation. Re-enabling upload re-records the client info the engine
    /// cleared when it was disabled.
    ///
    /// Disabling upload makes the engine drop its data and queue a
    /// deletion-request ping, which is handed to the upload worker.
    pub fn set_upload_enabled(&self, enabled: bool) {
        let _gate = self.registry.lock();
        if !self.is_initialized() {
            *lock(&self.pending_upload_enabled) = Some(enabled);
            return;
        }

        let slot = self.slot.clone();
        let ready = Arc::clone(&self.ready);
        let uploader = Arc::clone(&self.uploader);
        let _ = self.dispatcher.launch(move || {
            slot.with_live(|engine, handle| {
                let was_enabled = engine.is_upload_enabled(handle);
                if engine.set_upload_enabled(handle, enabled) {
                    uploader.enqueue();
                }
                if enabled && !was_enabled {
                    match read(&ready).as_ref() {
                        Some(ready) => engine.record_client_info(handle, &ready.client_info),
                        None => warn!("Client info unavailable, not recorded"),
                    }
                }
            });
        });
    }

    /// The engine's upload-enabled state, or the remembered value (default
    /// `true`) before init.
    pub fn get_upload_enabled(&self) -> bool {
        match self.slot.handle() {
            NO_HANDLE => self.pending_upload_enabled().unwrap_or(true),
            handle => self.slot.engine().is_upload_enabled(handle),
        }
    }

    /// Called by the host when the application goes to the background.
    /// Sends the configured background pings.
    pub fn handle_background(&self) -> Option<Completion> {
        let pings = lock(&self.background_pings).clone()?;
        self.send_pings_by_name(pings)
    }

    /// Wait until every queued operation has run.
    pub fn shutdown(&self) -> Result<()> {
        self.dispatcher.block_on_queue()
    }

    /// Let queued operations land before a test-only read.
    pub(crate) fn test_sync(&self) {
        if let Err(e) = self.dispatcher.block_on_queue() {
            warn!("Could not drain dispatcher queue: {}", e);
        }
    }

    /// Make every dispatched operation run synchronously on the caller.
    pub fn enable_testing_mode(&self) {
        self.dispatcher.set_testing_mode(true);
    }

    /// Destroy the engine so the client can be initialized again.
    pub fn test_destroy(&self) {
        let _guard = lock(&self.lifecycle);
        if !self.is_initialized() {
            return;
        }
        if let Err(e) = self.dispatcher.block_on_queue() {
            warn!("Could not drain dispatcher before destroy: {}", e);
        }
        let handle = self.slot.take();
        self.slot.engine().destroy(handle);
        *write(&self.ready) = None;
        *lock(&self.background_pings) = None;
        debug!(handle, "Engine destroyed");
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
