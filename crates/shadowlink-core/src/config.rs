//! Bridge configuration.
//!
//! Configuration is a JSON file located via, in order: an explicit path, the
//! `SHADOWLINK_CONFIG` environment variable, then `~/.shadowlink/config.json`.
//! A handful of fields can be overridden from the environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::topics::TopicLayout;

/// Default values.
pub mod defaults {
    pub const CONFIG_PATH: &str = "~/.shadowlink/config.json";
    pub const THING_NAME: &str = "shadowlink-bridge";
    pub const NAMESPACE: &str = "smarthome";
    pub const MQTT_PORT: u16 = 1883;
    pub const MQTTS_PORT: u16 = 8883;
    pub const KEEP_ALIVE_SECS: u64 = 30;
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const MIN_RECONNECT_DELAY_MS: u64 = 1_000;
    pub const MAX_RECONNECT_DELAY_MS: u64 = 128_000;
    pub const RECONNECT_MULTIPLIER: f64 = 2.0;
    pub const RECONNECT_JITTER: f64 = 0.2;
    pub const PENDING_RESPONSE_CAPACITY: usize = 64;
    pub const CERT_FILE: &str = "certificate.pem";
    pub const KEY_FILE: &str = "private.key";
    pub const ROOT_CA_FILE: &str = "root-ca.pem";
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG: &str = "SHADOWLINK_CONFIG";
    pub const ENDPOINT: &str = "SHADOWLINK_ENDPOINT";
    pub const THING_NAME: &str = "SHADOWLINK_THING_NAME";
    pub const NAMESPACE: &str = "SHADOWLINK_NAMESPACE";
}

/// Kind of built-in device to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Bulb,
    Switch,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bulb => write!(f, "bulb"),
            Self::Switch => write!(f, "switch"),
        }
    }
}

/// One device the bridge should register at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub kind: DeviceKind,
    /// Optional JSON file the device persists its state to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

/// Client certificate paths for mutual TLS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub root_ca_path: Option<PathBuf>,
}

/// Fully resolved TLS file locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub root_ca: PathBuf,
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.0 disables jitter)
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: defaults::MIN_RECONNECT_DELAY_MS,
            max_delay_ms: defaults::MAX_RECONNECT_DELAY_MS,
            multiplier: defaults::RECONNECT_MULTIPLIER,
            jitter: defaults::RECONNECT_JITTER,
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Broker host name
    #[serde(default)]
    pub endpoint: String,
    /// Broker port; defaults to 8883 with TLS and 1883 without
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_thing_name")]
    pub thing_name: String,
    /// MQTT client id; defaults to `thing_name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Device addressed by single-device desired patches; defaults to `thing_name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default = "default_pending_capacity")]
    pub pending_response_capacity: usize,
    /// JSON-lines file receiving state-change events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<PathBuf>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

fn default_thing_name() -> String {
    defaults::THING_NAME.to_string()
}

fn default_namespace() -> String {
    defaults::NAMESPACE.to_string()
}

fn default_keep_alive() -> u64 {
    defaults::KEEP_ALIVE_SECS
}

fn default_connect_timeout() -> u64 {
    defaults::CONNECT_TIMEOUT_SECS
}

fn default_pending_capacity() -> usize {
    defaults::PENDING_RESPONSE_CAPACITY
}

impl BridgeConfig {
    /// Create a configuration for `endpoint` with every other field defaulted.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: None,
            thing_name: default_thing_name(),
            client_id: None,
            namespace: default_namespace(),
            default_device_id: None,
            tls: None,
            keep_alive_secs: default_keep_alive(),
            clean_session: false,
            connect_timeout_secs: default_connect_timeout(),
            reconnect: ReconnectConfig::default(),
            pending_response_capacity: default_pending_capacity(),
            event_log: None,
            devices: Vec::new(),
        }
    }

    pub fn with_thing_name(mut self, thing_name: impl Into<String>) -> Self {
        self.thing_name = thing_name.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_device(mut self, id: impl Into<String>, kind: DeviceKind) -> Self {
        self.devices.push(DeviceSpec {
            id: id.into(),
            kind,
            state_file: None,
        });
        self
    }

    /// Load, resolve and validate configuration.
    ///
    /// `path` wins over `SHADOWLINK_CONFIG`, which wins over the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => std::env::var(env_vars::CONFIG)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(defaults::CONFIG_PATH)),
        };
        let path = expand_home(&path);

        if !path.exists() {
            return Err(Error::ConfigNotFound(path));
        }

        let contents = std::fs::read_to_string(&path)?;
        let mut config = Self::from_json_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());

        let config_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(config_dir);
        config.validate()?;

        info!(
            endpoint = %config.endpoint,
            thing = %config.thing_name,
            devices = config.devices.len(),
            "Loaded bridge config from {}",
            path.display()
        );
        Ok(config)
    }

    /// Parse configuration from JSON without resolving or validating it.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(env_vars::ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(thing_name) = lookup(env_vars::THING_NAME) {
            self.thing_name = thing_name;
        }
        if let Some(namespace) = lookup(env_vars::NAMESPACE) {
            self.namespace = namespace;
        }
    }

    /// Resolve relative paths against `config_dir` and fill in default TLS file names.
    pub fn resolve_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &Path| {
            let p = expand_home(p);
            if p.is_absolute() {
                p
            } else {
                config_dir.join(p)
            }
        };

        if let Some(tls) = self.tls.as_mut() {
            let cert_dir = config_dir.join(&self.thing_name);
            tls.cert_path = Some(
                tls.cert_path
                    .as_deref()
                    .map(resolve)
                    .unwrap_or_else(|| cert_dir.join(defaults::CERT_FILE)),
            );
            tls.key_path = Some(
                tls.key_path
                    .as_deref()
                    .map(resolve)
                    .unwrap_or_else(|| cert_dir.join(defaults::KEY_FILE)),
            );
            tls.root_ca_path = Some(
                tls.root_ca_path
                    .as_deref()
                    .map(resolve)
                    .unwrap_or_else(|| cert_dir.join(defaults::ROOT_CA_FILE)),
            );
        }

        for device in &mut self.devices {
            if let Some(state_file) = device.state_file.take() {
                device.state_file = Some(resolve(&state_file));
            }
        }

        if let Some(event_log) = self.event_log.take() {
            self.event_log = Some(resolve(&event_log));
        }
    }

    /// Check the configuration for problems that would prevent the bridge from running.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("endpoint cannot be empty".into()));
        }
        if self.thing_name.trim().is_empty() {
            return Err(Error::Config("thing_name cannot be empty".into()));
        }
        if self.namespace.trim_matches('/').is_empty() || has_wildcard(&self.namespace) {
            return Err(Error::Config(format!(
                "invalid namespace '{}'",
                self.namespace
            )));
        }

        if self.tls.is_some() {
            let files = self.tls_files().ok_or_else(|| {
                Error::Config("TLS paths are not resolved".to_string())
            })?;
            for (path, name) in [
                (&files.cert, "certificate"),
                (&files.key, "private key"),
                (&files.root_ca, "root CA"),
            ] {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "{} not found at {}",
                        name,
                        path.display()
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() || device.id.contains('/') || has_wildcard(&device.id) {
                return Err(Error::Config(format!("invalid device id '{}'", device.id)));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(Error::Config(format!("duplicate device id '{}'", device.id)));
            }
        }

        if self.reconnect.min_delay_ms == 0 || self.reconnect.max_delay_ms < self.reconnect.min_delay_ms {
            return Err(Error::Config(
                "reconnect delays must satisfy 0 < min_delay_ms <= max_delay_ms".into(),
            ));
        }

        Ok(())
    }

    /// Resolved TLS file locations, if TLS is configured.
    pub fn tls_files(&self) -> Option<TlsFiles> {
        let tls = self.tls.as_ref()?;
        Some(TlsFiles {
            cert: tls.cert_path.clone()?,
            key: tls.key_path.clone()?,
            root_ca: tls.root_ca_path.clone()?,
        })
    }

    pub fn broker_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls.is_some() {
            defaults::MQTTS_PORT
        } else {
            defaults::MQTT_PORT
        })
    }

    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.thing_name)
    }

    pub fn default_device_id(&self) -> &str {
        self.default_device_id.as_deref().unwrap_or(&self.thing_name)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn topic_layout(&self) -> TopicLayout {
        TopicLayout::for_thing(self.namespace.clone(), &self.thing_name)
    }
}

fn has_wildcard(s: &str) -> bool {
    s.contains('+') || s.contains('#')
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
