//! Experiment annotations.
//!
//! Annotations are forwarded to the engine through the dispatcher. The engine
//! hands them back JSON-encoded; decoding that is the only place this crate
//! can notice corrupt engine data.

use std::collections::HashMap;

use tracing::{error, warn};

use crate::coordinator::Coordinator;
use crate::error::{PingwellError, Result};
use crate::models::ExperimentRecord;

pub const MAX_EXPERIMENT_ID_LEN: usize = 100;
pub const MAX_BRANCH_LEN: usize = 100;
pub const MAX_EXTRAS: usize = 20;
pub const MAX_EXTRA_LEN: usize = 100;

/// Truncate `value` to at most `max` bytes on a char boundary.
fn truncate(field: &str, value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    warn!(field, max, "Experiment annotation truncated");
    value[..end].to_string()
}

/// Split extras into aligned key and value sequences: sorted by key, bounded
/// in count and length.
pub(crate) fn split_extras(extra: HashMap<String, String>) -> (Vec<String>, Vec<String>) {
    let mut pairs: Vec<_> = extra.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.len() > MAX_EXTRAS {
        warn!(count = pairs.len(), max = MAX_EXTRAS, "Too many experiment extras, dropping the rest");
        pairs.truncate(MAX_EXTRAS);
    }
    pairs
        .into_iter()
        .map(|(k, v)| {
            (
                truncate("extra key", &k, MAX_EXTRA_LEN),
                truncate("extra value", &v, MAX_EXTRA_LEN),
            )
        })
        .unzip()
}

/// Encode an annotation the way engines hand it back.
pub fn encode_experiment(branch: &str, keys: &[String], values: &[String]) -> Result<String> {
    let extra = (!keys.is_empty()).then(|| {
        keys.iter()
            .cloned()
            .zip(values.iter().cloned())
            .collect::<HashMap<_, _>>()
    });
    let record = ExperimentRecord {
        branch: branch.to_string(),
        extra,
    };
    Ok(serde_json::to_string(&record)?)
}

/// Decode an engine-encoded annotation. Anything malformed is corrupt data.
pub fn decode_experiment(experiment_id: &str, raw: &str) -> Result<ExperimentRecord> {
    serde_json::from_str(raw).map_err(|e| {
        PingwellError::CorruptData(format!("experiment '{}': {}", experiment_id, e))
    })
}

impl Coordinator {
    /// Annotate outgoing pings with an active experiment branch.
    pub fn set_experiment_active(
        &self,
        experiment_id: impl Into<String>,
        branch: impl Into<String>,
        extra: Option<HashMap<String, String>>,
    ) {
        if !self.is_initialized() {
            error!("Experiments can't be set before initialize");
            return;
        }

        let id = truncate("experiment id", &experiment_id.into(), MAX_EXPERIMENT_ID_LEN);
        let branch = truncate("branch", &branch.into(), MAX_BRANCH_LEN);
        let (keys, values) = extra.map(split_extras).unwrap_or_default();

        let slot = self.slot.clone();
        let _ = self.dispatcher.launch(move || {
            slot.with_live(|engine, handle| {
                engine.set_experiment_active(handle, &id, &branch, &keys, &values)
            });
        });
    }

    pub fn set_experiment_inactive(&self, experiment_id: impl Into<String>) {
        if !self.is_initialized() {
            error!("Experiments can't be cleared before initialize");
            return;
        }

        let id = truncate("experiment id", &experiment_id.into(), MAX_EXPERIMENT_ID_LEN);
        let slot = self.slot.clone();
        let _ = self.dispatcher.launch(move || {
            slot.with_live(|engine, handle| engine.set_experiment_inactive(handle, &id));
        });
    }

    pub fn test_is_experiment_active(&self, experiment_id: &str) -> bool {
        self.test_sync();
        self.slot
            .with_live(|engine, handle| engine.experiment_data(handle, experiment_id))
            .flatten()
            .is_some()
    }

    /// Branch and extras of an active experiment.
    ///
    /// Fails with [`PingwellError::CorruptData`] if the engine's encoding
    /// cannot be decoded, and [`PingwellError::ExperimentNotActive`] if there
    /// is nothing to decode.
    pub fn test_get_experiment_data(&self, experiment_id: &str) -> Result<ExperimentRecord> {
        self.test_sync();
        let raw = self
            .slot
            .with_live(|engine, handle| engine.experiment_data(handle, experiment_id))
            .flatten()
            .ok_or_else(|| PingwellError::ExperimentNotActive(experiment_id.to_string()))?;
        decode_experiment(experiment_id, &raw)
    }
}
