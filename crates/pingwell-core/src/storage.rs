//! Storage layer for the file-backed engine: YAML state, staged metrics,
//! pending ping files.
//!
//! Layout under the engine's data dir:
//!
//! ```text
//! state.yaml                  upload flag, client id, per-ping sequence numbers
//! experiments.yaml            active experiment annotations
//! db/<ping>.yaml              metrics staged for the next <ping>
//! pending_pings/<uuid>.json   assembled pings waiting for the upload worker
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PingwellError, Result};
use crate::models::{ExperimentRecord, MetricValue};

pub const DB_DIR: &str = "db";
pub const PENDING_PINGS_DIR: &str = "pending_pings";

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn pending_pings_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(PENDING_PINGS_DIR)
}

fn staged_path(data_dir: &Path, ping: &str) -> Result<PathBuf> {
    let valid = !ping.is_empty()
        && ping
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(PingwellError::InvalidPingName(ping.to_string()));
    }
    Ok(data_dir.join(DB_DIR).join(format!("{}.yaml", ping)))
}

// ─── YAML I/O ────────────────────────────────────────────────────────────────

pub fn save_yaml<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T>
where
    T: Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    let val = serde_yaml::from_str(&content)?;
    Ok(val)
}

// ─── Engine state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineState {
    pub upload_enabled: bool,
    pub client_id: Option<String>,
    #[serde(default)]
    pub seq: BTreeMap<String, u64>,
}

pub fn load_state(data_dir: &Path) -> Result<EngineState> {
    load_yaml(&data_dir.join("state.yaml"))
}

pub fn save_state(data_dir: &Path, state: &EngineState) -> Result<()> {
    save_yaml(&data_dir.join("state.yaml"), state)
}

pub fn load_experiments(data_dir: &Path) -> Result<BTreeMap<String, ExperimentRecord>> {
    load_yaml(&data_dir.join("experiments.yaml"))
}

pub fn save_experiments(
    data_dir: &Path,
    experiments: &BTreeMap<String, ExperimentRecord>,
) -> Result<()> {
    save_yaml(&data_dir.join("experiments.yaml"), experiments)
}

// ─── Staged metrics ──────────────────────────────────────────────────────────

/// Stage a metric value for the next `ping`. Overwrites an earlier value for
/// the same key.
pub fn stage_metric(data_dir: &Path, ping: &str, key: &str, value: MetricValue) -> Result<()> {
    let path = staged_path(data_dir, ping)?;
    ensure_dir(&data_dir.join(DB_DIR))?;
    let mut staged: BTreeMap<String, MetricValue> = load_yaml(&path)?;
    staged.insert(key.to_string(), value);
    save_yaml(&path, &staged)
}

pub fn load_staged(data_dir: &Path, ping: &str) -> Result<BTreeMap<String, MetricValue>> {
    load_yaml(&staged_path(data_dir, ping)?)
}

/// Keep at most `max_events` staged entries, in key order. The rest are
/// dropped from this ping.
pub fn cap_staged(
    ping: &str,
    staged: BTreeMap<String, MetricValue>,
    max_events: Option<usize>,
) -> BTreeMap<String, MetricValue> {
    match max_events {
        Some(max) if staged.len() > max => {
            warn!(ping, staged = staged.len(), max, "Too many staged entries, dropping the excess");
            staged.into_iter().take(max).collect()
        }
        _ => staged,
    }
}

pub fn clear_staged(data_dir: &Path, ping: &str) -> Result<()> {
    let path = staged_path(data_dir, ping)?;
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn clear_all_staged(data_dir: &Path) -> Result<()> {
    let dir = data_dir.join(DB_DIR);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    ensure_dir(&dir)
}

// ─── Pending pings ───────────────────────────────────────────────────────────

/// A ping waiting for upload: submission path plus JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPing {
    pub path: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingPingInfo {
    pub document_id: String,
    pub ping_name: String,
    pub size: u64,
}

pub fn write_pending_ping(data_dir: &Path, document_id: &str, ping: &PendingPing) -> Result<PathBuf> {
    let dir = pending_pings_dir(data_dir);
    ensure_dir(&dir)?;
    let path = dir.join(format!("{}.json", document_id));
    fs::write(&path, serde_json::to_vec(ping)?)?;
    Ok(path)
}

pub fn read_pending_ping(data_dir: &Path, document_id: &str) -> Result<PendingPing> {
    let path = pending_pings_dir(data_dir).join(format!("{}.json", document_id));
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

/// Pending pings, sorted by document id.
pub fn list_pending_pings(data_dir: &Path) -> Result<Vec<PendingPingInfo>> {
    let dir = pending_pings_dir(data_dir);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut out = vec![];
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let document_id = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        let ping: PendingPing = serde_json::from_slice(&fs::read(&path)?)?;
        // Submission paths look like /submit/<app>/<ping>/<version>/<doc id>.
        let ping_name = ping.path.split('/').nth(3).unwrap_or("unknown").to_string();
        out.push(PendingPingInfo {
            document_id,
            ping_name,
            size: entry.metadata()?.len(),
        });
    }
    out.sort_by(|a, b| a.document_id.cmp(&b.document_id));
    Ok(out)
}

pub fn clear_pending_pings(data_dir: &Path) -> Result<()> {
    let dir = pending_pings_dir(data_dir);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    ensure_dir(&dir)
}
