//! In-memory engine for tests.
//!
//! Keeps every boundary call in an ordered log so tests can assert exactly
//! what reached the engine and in which order. Read-only queries
//! (`is_upload_enabled`, `has_ping_type`, `experiment_data`) are not logged.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info};

use crate::boundary::{EngineBoundary, Handle, NO_HANDLE};
use crate::coordinator::lock;
use crate::experiments::encode_experiment;
use crate::models::{ClientInfo, MetricValue, PingType, DELETION_REQUEST_PING_NAME};
use crate::storage::cap_staged;

/// One boundary call, as the engine saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Create {
        data_dir: PathBuf,
        application_id: String,
        upload_enabled: bool,
        max_events: Option<usize>,
    },
    Destroy,
    SetUploadEnabled(bool),
    SetExperimentActive {
        id: String,
        branch: String,
        keys: Vec<String>,
        values: Vec<String>,
    },
    SetExperimentInactive(String),
    CollectPing(String),
    SendPing(String),
    SendPingByName(String),
    RegisterPingType(String),
    SignalReadyToSend,
    RecordClientInfo,
}

/// A ping the engine assembled and queued.
#[derive(Debug, Clone)]
pub struct SentPing {
    pub name: String,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct Instance {
    upload_enabled: bool,
    max_events: Option<usize>,
    pings: HashMap<String, PingType>,
    experiments: BTreeMap<String, String>,
    client_info: Option<ClientInfo>,
    seq: HashMap<String, u64>,
}

#[derive(Default)]
struct MemoryState {
    next_handle: Handle,
    fail_create: bool,
    registration_delay: Option<Duration>,
    instances: HashMap<Handle, Instance>,
    /// Staged metric data per ping name, shared by every instance.
    staged: HashMap<String, BTreeMap<String, MetricValue>>,
    calls: Vec<EngineCall>,
    sent: Vec<SentPing>,
}

#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose `create` always returns the no-engine sentinel.
    pub fn failing() -> Self {
        let engine = Self::default();
        lock(&engine.state).fail_create = true;
        engine
    }

    /// Make every `register_ping_type` call take at least `delay`.
    pub fn with_registration_delay(self, delay: Duration) -> Self {
        lock(&self.state).registration_delay = Some(delay);
        self
    }

    /// Give `ping` something to send.
    pub fn stage(&self, ping: &str, key: &str, value: impl Into<MetricValue>) {
        lock(&self.state)
            .staged
            .entry(ping.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Overwrite the stored encoding of an experiment on every live instance.
    pub fn plant_experiment_data(&self, experiment_id: &str, raw: &str) {
        for instance in lock(&self.state).instances.values_mut() {
            instance
                .experiments
                .insert(experiment_id.to_string(), raw.to_string());
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn sent_pings(&self) -> Vec<SentPing> {
        lock(&self.state).sent.clone()
    }

    pub fn live_handles(&self) -> usize {
        lock(&self.state).instances.len()
    }

    /// Client info recorded into the live instance, if any.
    pub fn client_info(&self) -> Option<ClientInfo> {
        lock(&self.state)
            .instances
            .values()
            .find_map(|i| i.client_info.clone())
    }

    fn log(&self, call: EngineCall) {
        lock(&self.state).calls.push(call);
    }
}

impl MemoryState {
    fn payload(&self, handle: Handle, ping: &PingType) -> Option<serde_json::Value> {
        let instance = self.instances.get(&handle)?;
        let staged = self.staged.get(ping.name()).cloned().unwrap_or_default();
        if !instance.upload_enabled || (staged.is_empty() && !ping.send_if_empty) {
            return None;
        }
        let seq = instance.seq.get(ping.name()).copied().unwrap_or(0);
        Some(json!({
            "ping_info": { "seq": seq, "experiments": instance.experiments },
            "client_info": instance.client_info,
            "metrics": cap_staged(ping.name(), staged, instance.max_events),
        }))
    }

    fn send(&mut self, handle: Handle, ping: &PingType, log_ping: bool) -> bool {
        let Some(payload) = self.payload(handle, ping) else {
            return false;
        };
        if log_ping {
            info!(ping = ping.name(), payload = %payload, "Ping assembled");
        }
        self.staged.remove(ping.name());
        self.push_sent(handle, ping.name(), payload);
        true
    }

    fn push_sent(&mut self, handle: Handle, name: &str, payload: serde_json::Value) {
        if let Some(instance) = self.instances.get_mut(&handle) {
            *instance.seq.entry(name.to_string()).or_insert(0) += 1;
        }
        self.sent.push(SentPing {
            name: name.to_string(),
            payload,
        });
    }
}

impl EngineBoundary for MemoryEngine {
    fn create(
        &self,
        data_dir: &Path,
        application_id: &str,
        upload_enabled: bool,
        max_events: Option<usize>,
    ) -> Handle {
        let mut state = lock(&self.state);
        state.calls.push(EngineCall::Create {
            data_dir: data_dir.to_path_buf(),
            application_id: application_id.to_string(),
            upload_enabled,
            max_events,
        });
        if state.fail_create {
            return NO_HANDLE;
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.instances.insert(
            handle,
            Instance {
                upload_enabled,
                max_events,
                ..Default::default()
            },
        );
        handle
    }

    fn destroy(&self, handle: Handle) {
        let mut state = lock(&self.state);
        state.calls.push(EngineCall::Destroy);
        state.instances.remove(&handle);
    }

    fn set_upload_enabled(&self, handle: Handle, enabled: bool) -> bool {
        let mut state = lock(&self.state);
        state.calls.push(EngineCall::SetUploadEnabled(enabled));
        let Some(instance) = state.instances.get_mut(&handle) else {
            return false;
        };
        let was_enabled = std::mem::replace(&mut instance.upload_enabled, enabled);
        if enabled {
            return false;
        }

        let client_info = instance.client_info.take();
        state.staged.clear();
        if !was_enabled {
            return false;
        }
        let deletion_request = json!({
            "ping_info": { "reason": "set_upload_enabled" },
            "client_info": client_info,
        });
        state.push_sent(handle, DELETION_REQUEST_PING_NAME, deletion_request);
        true
    }

    fn is_upload_enabled(&self, handle: Handle) -> bool {
        lock(&self.state)
            .instances
            .get(&handle)
            .map(|i| i.upload_enabled)
            .unwrap_or(false)
    }

    fn set_experiment_active(
        &self,
        handle: Handle,
        experiment_id: &str,
        branch: &str,
        keys: &[String],
        values: &[String],
    ) {
        self.log(EngineCall::SetExperimentActive {
            id: experiment_id.to_string(),
            branch: branch.to_string(),
            keys: keys.to_vec(),
            values: values.to_vec(),
        });
        let encoded = match encode_experiment(branch, keys, values) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode experiment: {}", e);
                return;
            }
        };
        if let Some(instance) = lock(&self.state).instances.get_mut(&handle) {
            instance
                .experiments
                .insert(experiment_id.to_string(), encoded);
        }
    }

    fn set_experiment_inactive(&self, handle: Handle, experiment_id: &str) {
        let mut state = lock(&self.state);
        state
            .calls
            .push(EngineCall::SetExperimentInactive(experiment_id.to_string()));
        if let Some(instance) = state.instances.get_mut(&handle) {
            instance.experiments.remove(experiment_id);
        }
    }

    fn experiment_data(&self, handle: Handle, experiment_id: &str) -> Option<String> {
        lock(&self.state)
            .instances
            .get(&handle)?
            .experiments
            .get(experiment_id)
            .cloned()
    }

    fn collect_ping(&self, handle: Handle, ping: &PingType) -> Option<String> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(EngineCall::CollectPing(ping.name().to_string()));
        state.payload(handle, ping).map(|p| p.to_string())
    }

    fn send_ping(&self, handle: Handle, ping: &PingType, log_ping: bool) -> bool {
        let mut state = lock(&self.state);
        state.calls.push(EngineCall::SendPing(ping.name().to_string()));
        state.send(handle, ping, log_ping)
    }

    fn send_ping_by_name(&self, handle: Handle, ping_name: &str, log_ping: bool) -> bool {
        let mut state = lock(&self.state);
        state
            .calls
            .push(EngineCall::SendPingByName(ping_name.to_string()));
        let ping = state
            .instances
            .get(&handle)
            .and_then(|i| i.pings.get(ping_name))
            .cloned();
        match ping {
            Some(ping) => state.send(handle, &ping, log_ping),
            None => {
                error!(ping = ping_name, "Attempted to send unknown ping");
                false
            }
        }
    }

    fn register_ping_type(&self, handle: Handle, ping: &PingType) {
        let delay = lock(&self.state).registration_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = lock(&self.state);
        state
            .calls
            .push(EngineCall::RegisterPingType(ping.name().to_string()));
        if let Some(instance) = state.instances.get_mut(&handle) {
            instance.pings.insert(ping.name().to_string(), ping.clone());
        }
    }

    fn has_ping_type(&self, handle: Handle, ping_name: &str) -> bool {
        lock(&self.state)
            .instances
            .get(&handle)
            .map(|i| i.pings.contains_key(ping_name))
            .unwrap_or(false)
    }

    fn signal_ready_to_send(&self, _handle: Handle) -> bool {
        self.log(EngineCall::SignalReadyToSend);
        false
    }

    fn record_client_info(&self, handle: Handle, info: &ClientInfo) {
        let mut state = lock(&self.state);
        state.calls.push(EngineCall::RecordClientInfo);
        if let Some(instance) = state.instances.get_mut(&handle) {
            instance.client_info = Some(info.clone());
        }
    }
}
