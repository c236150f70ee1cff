//! Data models for pingwell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{PingwellError, Result};

/// Default directory name, relative to the host's files directory.
pub const DEFAULT_DATA_DIR_NAME: &str = "pingwell_data";

/// Ping queued by the engine when upload goes from enabled to disabled.
pub const DELETION_REQUEST_PING_NAME: &str = "deletion-request";

/// Pings sent when the application moves to the background.
pub const DEFAULT_BACKGROUND_PINGS: [&str; 2] = ["baseline", "events"];

/// Client configuration, fixed once `initialize` has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Upload-enabled state handed to the engine if the application never
    /// called `set_upload_enabled` before init.
    pub upload_enabled: bool,
    /// Ask the engine to log every assembled ping payload.
    pub log_pings: bool,
    /// Release channel label, recorded with the client info (e.g. "nightly").
    pub channel: Option<String>,
    /// Most staged entries a single ping carries. `None` means no cap.
    pub max_events: Option<usize>,
    /// Where pending pings are eventually submitted.
    pub server_endpoint: Option<String>,
    /// Name of the engine's data directory inside the host files directory.
    pub data_dir_name: String,
    /// Ping names the background observer sends.
    pub background_pings: Vec<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            upload_enabled: true,
            log_pings: false,
            channel: None,
            max_events: None,
            server_endpoint: None,
            data_dir_name: DEFAULT_DATA_DIR_NAME.to_string(),
            background_pings: DEFAULT_BACKGROUND_PINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_log_pings(mut self, log_pings: bool) -> Self {
        self.log_pings = log_pings;
        self
    }

    pub fn with_upload_enabled(mut self, upload_enabled: bool) -> Self {
        self.upload_enabled = upload_enabled;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = Some(max_events);
        self
    }

    pub fn with_server_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.server_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_background_pings<I, S>(mut self, pings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.background_pings = pings.into_iter().map(Into::into).collect();
        self
    }
}

/// What the host process tells the client about itself at init.
#[derive(Debug, Clone)]
pub struct InitContext {
    /// Application-private files directory. The engine's data dir lives below it.
    pub files_dir: PathBuf,
    /// Name of the process calling `initialize`.
    pub process_name: String,
    /// Name of the application package. The main process carries this name.
    pub package_name: String,
}

impl InitContext {
    /// Context for the main process of `package_name`.
    pub fn new(files_dir: impl Into<PathBuf>, package_name: impl Into<String>) -> Self {
        let package_name = package_name.into();
        Self {
            files_dir: files_dir.into(),
            process_name: package_name.clone(),
            package_name,
        }
    }

    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    pub fn is_main_process(&self) -> bool {
        self.process_name == self.package_name
    }

    /// Application id as reported to the engine: the package name, lowercased,
    /// with every run of non-alphanumeric characters collapsed to a single `-`.
    pub fn application_id(&self) -> String {
        sanitize_application_id(&self.package_name)
    }

    pub fn data_dir(&self, config: &Configuration) -> PathBuf {
        self.files_dir.join(&config.data_dir_name)
    }
}

pub fn sanitize_application_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out
}

/// Platform metadata recorded into every ping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub app_build: String,
    pub app_display_version: String,
    pub app_channel: Option<String>,
    pub os: String,
    pub os_version: String,
    pub architecture: String,
    pub device_manufacturer: Option<String>,
    pub device_model: Option<String>,
    pub locale: Option<String>,
}

impl ClientInfo {
    /// Gather client info from `provider`.
    ///
    /// The build identifier must be present in every ping, so a provider that
    /// cannot report it makes initialization fail.
    pub fn collect(provider: &dyn ClientInfoProvider, channel: Option<&str>) -> Result<Self> {
        let app_build = provider
            .app_build()
            .filter(|b| !b.is_empty())
            .ok_or(PingwellError::MissingClientInfo("app_build"))?;

        Ok(Self {
            app_build,
            app_display_version: provider
                .app_display_version()
                .unwrap_or_else(|| "Unknown".to_string()),
            app_channel: channel.map(str::to_string),
            os: std::env::consts::OS.to_string(),
            os_version: provider
                .os_version()
                .unwrap_or_else(|| "Unknown".to_string()),
            architecture: std::env::consts::ARCH.to_string(),
            device_manufacturer: provider.device_manufacturer(),
            device_model: provider.device_model(),
            locale: provider.locale(),
        })
    }
}

/// Source of platform metadata. Implemented by the host.
pub trait ClientInfoProvider: Send + Sync {
    /// `None` when the platform cannot report a build identifier.
    fn app_build(&self) -> Option<String>;

    fn app_display_version(&self) -> Option<String> {
        None
    }

    fn os_version(&self) -> Option<String> {
        None
    }

    fn device_manufacturer(&self) -> Option<String> {
        None
    }

    fn device_model(&self) -> Option<String> {
        None
    }

    fn locale(&self) -> Option<String> {
        None
    }
}

/// Fixed client info, for hosts that know everything up front.
#[derive(Debug, Clone, Default)]
pub struct StaticClientInfo {
    pub app_build: Option<String>,
    pub app_display_version: Option<String>,
    pub os_version: Option<String>,
    pub device_manufacturer: Option<String>,
    pub device_model: Option<String>,
    pub locale: Option<String>,
}

impl StaticClientInfo {
    pub fn new(app_build: impl Into<String>) -> Self {
        Self {
            app_build: Some(app_build.into()),
            ..Default::default()
        }
    }

    /// Provider with no build identifier.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn with_display_version(mut self, version: impl Into<String>) -> Self {
        self.app_display_version = Some(version.into());
        self
    }
}

impl ClientInfoProvider for StaticClientInfo {
    fn app_build(&self) -> Option<String> {
        self.app_build.clone()
    }

    fn app_display_version(&self) -> Option<String> {
        self.app_display_version.clone()
    }

    fn os_version(&self) -> Option<String> {
        self.os_version.clone()
    }

    fn device_manufacturer(&self) -> Option<String> {
        self.device_manufacturer.clone()
    }

    fn device_model(&self) -> Option<String> {
        self.device_model.clone()
    }

    fn locale(&self) -> Option<String> {
        self.locale.clone()
    }
}

static NEXT_PING_HANDLE: AtomicU64 = AtomicU64::new(1);

/// A named kind of ping.
///
/// Every `PingType` gets a process-unique, non-zero handle at construction;
/// the engine identifies the ping by that handle once it is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingType {
    name: String,
    handle: u64,
    pub include_client_id: bool,
    pub send_if_empty: bool,
    pub reason_codes: Vec<String>,
}

impl PingType {
    pub fn new(
        name: impl Into<String>,
        include_client_id: bool,
        send_if_empty: bool,
        reason_codes: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            handle: NEXT_PING_HANDLE.fetch_add(1, Ordering::Relaxed),
            include_client_id,
            send_if_empty,
            reason_codes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }
}

/// Experiment annotation as read back from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, String>>,
}

/// A single staged metric value: float, int, bool or string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    /// Parse a command-line style value: integers, then floats, then booleans,
    /// falling back to text.
    pub fn parse(raw: &str) -> Self {
        if let Ok(v) = raw.parse::<i64>() {
            MetricValue::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            MetricValue::Float(v)
        } else if let Ok(v) = raw.parse::<bool>() {
            MetricValue::Bool(v)
        } else {
            MetricValue::Text(raw.to_string())
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}
impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}
impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}
impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Bool(v) => write!(f, "{}", v),
            MetricValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Result of a call to `Coordinator::initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This call created the engine and ran every init side effect.
    Initialized,
    /// The engine already exists; nothing happened.
    AlreadyInitialized,
    /// Another thread is initializing right now; this call was rejected.
    InProgress,
    /// Called outside the main process; nothing happened.
    NotMainProcess,
    /// The engine refused to start (e.g. its data dir is unusable).
    EngineUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_id_is_sanitized() {
        assert_eq!(sanitize_application_id("org.mozilla.Fenix"), "org-mozilla-fenix");
        assert_eq!(sanitize_application_id("a..b__c"), "a-b-c");
    }

    #[test]
    fn secondary_process_is_not_main() {
        let ctx = InitContext::new("/tmp", "org.example.app")
            .with_process_name("org.example.app:remote");
        assert!(!ctx.is_main_process());
        assert!(InitContext::new("/tmp", "org.example.app").is_main_process());
    }

    #[test]
    fn client_info_requires_build() {
        let err = ClientInfo::collect(&StaticClientInfo::unknown(), None).unwrap_err();
        assert!(matches!(err, PingwellError::MissingClientInfo("app_build")));

        let info = ClientInfo::collect(&StaticClientInfo::new("42"), Some("beta")).unwrap();
        assert_eq!(info.app_build, "42");
        assert_eq!(info.app_channel.as_deref(), Some("beta"));
        assert_eq!(info.app_display_version, "Unknown");
    }

    #[test]
    fn configuration_yaml_fills_in_defaults() {
        let config: Configuration =
            serde_yaml::from_str("max_events: 5\nchannel: beta\n").unwrap();
        assert_eq!(config.max_events, Some(5));
        assert_eq!(config.channel.as_deref(), Some("beta"));
        assert!(config.upload_enabled);
        assert_eq!(Configuration::new().max_events, None);
        assert_eq!(Configuration::new().with_max_events(3).max_events, Some(3));
    }

    #[test]
    fn ping_handles_are_unique_and_non_zero() {
        let a = PingType::new("a", true, false, vec![]);
        let b = PingType::new("a", true, false, vec![]);
        assert_ne!(a.handle(), 0);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn configuration_from_partial_yaml() {
        let cfg: Configuration = serde_yaml::from_str("log_pings: true\nchannel: nightly\n").unwrap();
        assert!(cfg.log_pings);
        assert!(cfg.upload_enabled);
        assert_eq!(cfg.channel.as_deref(), Some("nightly"));
        assert_eq!(cfg.background_pings, vec!["baseline", "events"]);
    }

    #[test]
    fn metric_value_parse() {
        assert_eq!(MetricValue::parse("3"), MetricValue::Int(3));
        assert_eq!(MetricValue::parse("0.5"), MetricValue::Float(0.5));
        assert_eq!(MetricValue::parse("true"), MetricValue::Bool(true));
        assert_eq!(MetricValue::parse("hi"), MetricValue::Text("hi".into()));
    }
}
