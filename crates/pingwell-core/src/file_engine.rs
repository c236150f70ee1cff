//! File-backed engine.
//!
//! Assembles pings from metrics staged under the data dir and writes them as
//! pending ping files for an upload worker. Layout is described in
//! [`crate::storage`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::boundary::{EngineBoundary, Handle, NO_HANDLE};
use crate::coordinator::lock;
use crate::error::Result;
use crate::models::{ClientInfo, ExperimentRecord, PingType, DELETION_REQUEST_PING_NAME};
use crate::storage::{self, EngineState, PendingPing};

struct FileInstance {
    data_dir: PathBuf,
    application_id: String,
    state: EngineState,
    pings: HashMap<String, PingType>,
    experiments: BTreeMap<String, ExperimentRecord>,
    client_info: Option<ClientInfo>,
    max_events: Option<usize>,
    start_time: DateTime<Utc>,
}

impl FileInstance {
    fn open(
        data_dir: &Path,
        application_id: &str,
        upload_enabled: bool,
        max_events: Option<usize>,
    ) -> Result<Self> {
        storage::ensure_dir(data_dir)?;
        storage::ensure_dir(&data_dir.join(storage::DB_DIR))?;
        storage::ensure_dir(&storage::pending_pings_dir(data_dir))?;

        let mut state = storage::load_state(data_dir).unwrap_or_else(|e| {
            warn!("Engine state unreadable, starting fresh: {}", e);
            EngineState::default()
        });
        if state.client_id.is_none() {
            state.client_id = Some(Uuid::new_v4().to_string());
        }
        let was_enabled = std::mem::replace(&mut state.upload_enabled, upload_enabled);
        storage::save_state(data_dir, &state)?;

        let experiments = storage::load_experiments(data_dir).unwrap_or_default();

        let mut instance = Self {
            data_dir: data_dir.to_path_buf(),
            application_id: application_id.to_string(),
            state,
            pings: HashMap::new(),
            experiments,
            client_info: None,
            max_events,
            start_time: Utc::now(),
        };
        if !upload_enabled {
            // Upload was turned off while no engine was running.
            instance.clear_data();
            if was_enabled {
                instance.queue_deletion_request("at_init");
            }
        }
        Ok(instance)
    }

    fn save_state(&self) {
        if let Err(e) = storage::save_state(&self.data_dir, &self.state) {
            error!("Failed to save engine state: {}", e);
        }
    }

    fn save_experiments(&self) {
        if let Err(e) = storage::save_experiments(&self.data_dir, &self.experiments) {
            error!("Failed to save experiments: {}", e);
        }
    }

    /// Drop everything collected so far. Run whenever upload is disabled.
    fn clear_data(&mut self) {
        if let Err(e) = storage::clear_all_staged(&self.data_dir) {
            error!("Failed to clear staged metrics: {}", e);
        }
        if let Err(e) = storage::clear_pending_pings(&self.data_dir) {
            error!("Failed to clear pending pings: {}", e);
        }
        self.client_info = None;
    }

    /// Disable upload, dropping collected data. Returns whether a
    /// deletion-request ping was queued in its place.
    fn disable_upload(&mut self) -> bool {
        let was_enabled = std::mem::replace(&mut self.state.upload_enabled, false);
        self.clear_data();
        let queued = was_enabled && self.queue_deletion_request("set_upload_enabled");
        self.save_state();
        queued
    }

    fn queue_deletion_request(&mut self, reason: &str) -> bool {
        let seq = self
            .state
            .seq
            .get(DELETION_REQUEST_PING_NAME)
            .copied()
            .unwrap_or(0);
        let body = json!({
            "ping_info": {
                "seq": seq,
                "reason": reason,
                "start_time": self.start_time.to_rfc3339(),
                "end_time": Utc::now().to_rfc3339(),
            },
            "client_info": { "client_id": self.state.client_id },
        });
        let queued = self.store(DELETION_REQUEST_PING_NAME, body, false);
        if queued {
            info!(reason, "Deletion-request ping queued");
        }
        queued
    }

    fn collect(&self, ping: &PingType) -> Option<serde_json::Value> {
        if !self.state.upload_enabled {
            return None;
        }
        let metrics = match storage::load_staged(&self.data_dir, ping.name()) {
            Ok(metrics) => metrics,
            Err(e) => {
                error!(ping = ping.name(), "Staged metrics unreadable: {}", e);
                return None;
            }
        };
        if metrics.is_empty() && !ping.send_if_empty {
            return None;
        }
        let metrics = storage::cap_staged(ping.name(), metrics, self.max_events);

        let seq = self.state.seq.get(ping.name()).copied().unwrap_or(0);
        let mut client_info = self
            .client_info
            .as_ref()
            .and_then(|info| serde_json::to_value(info).ok())
            .unwrap_or_else(|| json!({}));
        if ping.include_client_id {
            if let (Some(obj), Some(id)) = (client_info.as_object_mut(), &self.state.client_id) {
                obj.insert("client_id".to_string(), json!(id));
            }
        }

        let mut ping_info = json!({
            "seq": seq,
            "start_time": self.start_time.to_rfc3339(),
            "end_time": Utc::now().to_rfc3339(),
        });
        if !self.experiments.is_empty() {
            ping_info["experiments"] = json!(self.experiments);
        }

        Some(json!({
            "ping_info": ping_info,
            "client_info": client_info,
            "metrics": metrics,
        }))
    }

    fn send(&mut self, ping: &PingType, log_ping: bool) -> bool {
        let Some(body) = self.collect(ping) else {
            return false;
        };
        if !self.store(ping.name(), body, log_ping) {
            return false;
        }
        if let Err(e) = storage::clear_staged(&self.data_dir, ping.name()) {
            warn!(ping = ping.name(), "Failed to clear staged metrics: {}", e);
        }
        self.start_time = Utc::now();
        true
    }

    /// Write an assembled ping to the pending pings dir and bump its sequence
    /// number.
    fn store(&mut self, ping_name: &str, body: serde_json::Value, log_ping: bool) -> bool {
        let document_id = Uuid::new_v4().to_string();
        let pending = PendingPing {
            path: format!(
                "/submit/{}/{}/1/{}",
                self.application_id, ping_name, document_id
            ),
            body,
        };
        if log_ping {
            info!(ping = ping_name, payload = %pending.body, "Ping assembled");
        }
        if let Err(e) = storage::write_pending_ping(&self.data_dir, &document_id, &pending) {
            error!(ping = ping_name, "Failed to store pending ping: {}", e);
            return false;
        }

        *self.state.seq.entry(ping_name.to_string()).or_insert(0) += 1;
        self.save_state();
        true
    }
}

#[derive(Default)]
struct FileEngineInner {
    next_handle: Handle,
    instances: HashMap<Handle, FileInstance>,
}

/// Engine persisting staged metrics and assembled pings on disk.
#[derive(Default)]
pub struct FileEngine {
    inner: Mutex<FileEngineInner>,
}

impl FileEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_instance<R>(&self, handle: Handle, f: impl FnOnce(&mut FileInstance) -> R) -> Option<R> {
        let mut inner = lock(&self.inner);
        match inner.instances.get_mut(&handle) {
            Some(instance) => Some(f(instance)),
            None => {
                warn!(handle, "Unknown engine handle");
                None
            }
        }
    }
}

impl EngineBoundary for FileEngine {
    fn create(
        &self,
        data_dir: &Path,
        application_id: &str,
        upload_enabled: bool,
        max_events: Option<usize>,
    ) -> Handle {
        let instance = match FileInstance::open(data_dir, application_id, upload_enabled, max_events) {
            Ok(instance) => instance,
            Err(e) => {
                error!(data_dir = %data_dir.display(), "Unable to open engine data dir: {}", e);
                return NO_HANDLE;
            }
        };
        let mut inner = lock(&self.inner);
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.instances.insert(handle, instance);
        debug!(handle, data_dir = %data_dir.display(), "File engine created");
        handle
    }

    fn destroy(&self, handle: Handle) {
        lock(&self.inner).instances.remove(&handle);
    }

    fn set_upload_enabled(&self, handle: Handle, enabled: bool) -> bool {
        self.with_instance(handle, |instance| {
            if instance.state.upload_enabled == enabled {
                return false;
            }
            if !enabled {
                return instance.disable_upload();
            }
            instance.state.upload_enabled = true;
            instance.save_state();
            false
        })
        .unwrap_or(false)
    }

    fn is_upload_enabled(&self, handle: Handle) -> bool {
        self.with_instance(handle, |instance| instance.state.upload_enabled)
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
        self.with_instance(handle, |instance| {
            let extra = (!keys.is_empty())
                .then(|| keys.iter().cloned().zip(values.iter().cloned()).collect());
            instance.experiments.insert(
                experiment_id.to_string(),
                ExperimentRecord {
                    branch: branch.to_string(),
                    extra,
                },
            );
            instance.save_experiments();
        });
    }

    fn set_experiment_inactive(&self, handle: Handle, experiment_id: &str) {
        self.with_instance(handle, |instance| {
            if instance.experiments.remove(experiment_id).is_some() {
                instance.save_experiments();
            }
        });
    }

    fn experiment_data(&self, handle: Handle, experiment_id: &str) -> Option<String> {
        self.with_instance(handle, |instance| {
            let record = instance.experiments.get(experiment_id)?;
            serde_json::to_string(record).ok()
        })
        .flatten()
    }

    fn collect_ping(&self, handle: Handle, ping: &PingType) -> Option<String> {
        self.with_instance(handle, |instance| instance.collect(ping))
            .flatten()
            .map(|body| body.to_string())
    }

    fn send_ping(&self, handle: Handle, ping: &PingType, log_ping: bool) -> bool {
        self.with_instance(handle, |instance| instance.send(ping, log_ping))
            .unwrap_or(false)
    }

    fn send_ping_by_name(&self, handle: Handle, ping_name: &str, log_ping: bool) -> bool {
        self.with_instance(handle, |instance| match instance.pings.get(ping_name).cloned() {
            Some(ping) => instance.send(&ping, log_ping),
            None => {
                error!(ping = ping_name, "Attempted to send unknown ping");
                false
            }
        })
        .unwrap_or(false)
    }

    fn register_ping_type(&self, handle: Handle, ping: &PingType) {
        self.with_instance(handle, |instance| {
            instance.pings.insert(ping.name().to_string(), ping.clone());
        });
    }

    fn has_ping_type(&self, handle: Handle, ping_name: &str) -> bool {
        self.with_instance(handle, |instance| instance.pings.contains_key(ping_name))
            .unwrap_or(false)
    }

    fn signal_ready_to_send(&self, handle: Handle) -> bool {
        self.with_instance(handle, |instance| {
            match storage::list_pending_pings(&instance.data_dir) {
                Ok(pending) => {
                    debug!(handle, pending = pending.len(), "File engine ready to send");
                    !pending.is_empty()
                }
                Err(e) => {
                    warn!("Pending pings unreadable: {}", e);
                    false
                }
            }
        })
        .unwrap_or(false)
    }

    fn record_client_info(&self, handle: Handle, info: &ClientInfo) {
        self.with_instance(handle, |instance| {
            instance.client_info = Some(info.clone());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricValue;
    use tempfile::TempDir;

    fn ping(name: &str) -> PingType {
        PingType::new(name, true, false, vec![])
    }

    #[test]
    fn create_fails_when_data_dir_is_a_file() {
        let tmp = TempDir::new().unwrap();
        let file_path = tmp.path().join("notadir");
        std::fs::write(&file_path, "test").unwrap();

        let engine = FileEngine::new();
        assert_eq!(engine.create(&file_path, "app", true, None), NO_HANDLE);
    }

    #[test]
    fn empty_ping_is_not_sent() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "app", true, None);

        assert!(!engine.send_ping(handle, &ping("metrics"), false));
        assert!(storage::list_pending_pings(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn staged_ping_is_written_as_pending() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "org-example-app", true, None);
        storage::stage_metric(tmp.path(), "metrics", "count", MetricValue::Int(3)).unwrap();

        assert!(engine.send_ping(handle, &ping("metrics"), false));

        let pending = storage::list_pending_pings(tmp.path()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ping_name, "metrics");

        let stored = storage::read_pending_ping(tmp.path(), &pending[0].document_id).unwrap();
        assert!(stored.path.starts_with("/submit/org-example-app/metrics/1/"));
        assert_eq!(stored.body["metrics"]["count"], 3);
        assert_eq!(stored.body["ping_info"]["seq"], 0);
        assert!(stored.body["client_info"]["client_id"].is_string());

        // Staged data is consumed.
        assert!(!engine.send_ping(handle, &ping("metrics"), false));
        assert_eq!(storage::load_state(tmp.path()).unwrap().seq["metrics"], 1);
    }

    #[test]
    fn send_if_empty_pings_always_send() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "app", true, None);
        let always = PingType::new("baseline", true, true, vec![]);

        assert!(engine.send_ping(handle, &always, false));
        assert!(engine.send_ping(handle, &always, false));
        assert_eq!(storage::list_pending_pings(tmp.path()).unwrap().len(), 2);
    }

    #[test]
    fn disabling_upload_clears_data() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "app", true, None);
        storage::stage_metric(tmp.path(), "metrics", "a", MetricValue::Int(1)).unwrap();
        storage::stage_metric(tmp.path(), "events", "b", MetricValue::Int(1)).unwrap();
        assert!(engine.send_ping(handle, &ping("metrics"), false));

        assert!(engine.set_upload_enabled(handle, false));

        assert!(!engine.is_upload_enabled(handle));
        let pending = storage::list_pending_pings(tmp.path()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ping_name, DELETION_REQUEST_PING_NAME);
        let deletion = storage::read_pending_ping(tmp.path(), &pending[0].document_id).unwrap();
        assert_eq!(deletion.body["ping_info"]["reason"], "set_upload_enabled");
        assert!(deletion.body["client_info"]["client_id"].is_string());
        assert!(deletion.body.get("metrics").is_none());

        assert!(storage::load_staged(tmp.path(), "events").unwrap().is_empty());
        assert!(!engine.send_ping(handle, &ping("events"), false));

        // Already disabled: nothing new.
        assert!(!engine.set_upload_enabled(handle, false));
        assert_eq!(storage::list_pending_pings(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn disabling_upload_between_runs_queues_deletion_request() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "app", true, None);
        assert!(!engine.signal_ready_to_send(handle));
        engine.destroy(handle);

        let handle = engine.create(tmp.path(), "app", false, None);
        let pending = storage::list_pending_pings(tmp.path()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ping_name, DELETION_REQUEST_PING_NAME);
        assert!(engine.signal_ready_to_send(handle));
        engine.destroy(handle);

        // Still disabled on the next run: no second deletion request.
        engine.create(tmp.path(), "app", false, None);
        assert_eq!(storage::list_pending_pings(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn max_events_caps_assembled_metrics() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "app", true, Some(2));
        for key in ["c", "a", "b"] {
            storage::stage_metric(tmp.path(), "events", key, MetricValue::Int(1)).unwrap();
        }

        let raw = engine.collect_ping(handle, &ping("events")).unwrap();
        let body: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let keys: Vec<_> = body["metrics"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn experiments_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "app", true, None);
        engine.set_experiment_active(handle, "exp", "branch-a", &["k".into()], &["v".into()]);
        engine.destroy(handle);

        let handle = engine.create(tmp.path(), "app", true, None);
        let raw = engine.experiment_data(handle, "exp").unwrap();
        let record: ExperimentRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.branch, "branch-a");
        assert_eq!(record.extra.unwrap()["k"], "v");
    }

    #[test]
    fn unknown_ping_name_is_not_sent() {
        let tmp = TempDir::new().unwrap();
        let engine = FileEngine::new();
        let handle = engine.create(tmp.path(), "app", true, None);
        assert!(!engine.send_ping_by_name(handle, "nope", false));
        assert!(!engine.has_ping_type(handle, "nope"));
    }
}
