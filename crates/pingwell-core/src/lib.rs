//! pingwell-core: lifecycle, dispatch and ping-send coordination for a
//! telemetry client.
//!
//! The central design principle: every call that changes what the engine
//! sees is a channel send onto a single ordered queue, never blocking the
//! application. One background worker applies the operations in submission
//! order; testing mode runs them on the caller instead.

pub mod boundary;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod experiments;
pub mod file_engine;
pub mod memory_engine;
pub mod models;
mod registry;
pub mod sender;
pub mod storage;
pub mod upload;

pub use boundary::{EngineBoundary, Handle, NO_HANDLE};
pub use coordinator::Coordinator;
pub use dispatcher::{Completion, Dispatcher};
pub use error::{PingwellError, Result};
pub use file_engine::FileEngine;
pub use memory_engine::{EngineCall, MemoryEngine, SentPing};
pub use models::{
    ClientInfo, ClientInfoProvider, Configuration, ExperimentRecord, InitContext, InitOutcome,
    MetricValue, PingType, StaticClientInfo,
};
pub use sender::SendablePing;
pub use upload::{CountingScheduler, PendingPingsScheduler, UploadScheduler};
