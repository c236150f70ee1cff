//! Error types for pingwell-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PingwellError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dispatcher channel closed")]
    ChannelClosed,

    /// The engine handed back data this client cannot decode.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Experiment not active: {0}")]
    ExperimentNotActive(String),

    /// Required platform metadata was unavailable during initialization.
    #[error("Required client info missing: {0}")]
    MissingClientInfo(&'static str),

    /// Ping names end up in file names; only `[A-Za-z0-9_-]` is accepted.
    #[error("Invalid ping name: {0:?}")]
    InvalidPingName(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PingwellError>;
