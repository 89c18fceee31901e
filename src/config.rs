//! Configuration system for meshnote
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (MESHNOTE_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Main mesh configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Local identity and role preference
    pub node: NodeSettings,

    /// Local-network (UDP announce + TCP) transport
    pub lan: LanSettings,

    /// Direct-link (group owner / client) transport
    pub direct: DirectSettings,

    /// Proximity clustering transport
    pub cluster: ClusterSettings,

    /// Session coordinator tuning
    pub session: SessionSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Local node settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Fixed identity (a fresh one is generated per session if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name shown to peers (defaults to the hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Ask for the group-owner role on the direct-link transport
    pub host_preferred: bool,
}

/// Local-network transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanSettings {
    /// Enable the local-network transport
    pub enabled: bool,

    /// Address to bind both sockets on
    pub bind_addr: String,

    /// TCP port for line-framed peer connections (0 = auto-assign)
    pub data_port: u16,

    /// UDP port announces are sent to and received on
    pub discovery_port: u16,

    /// Interval between announces in milliseconds
    pub announce_interval_ms: u64,

    /// Forget a discovered peer after this many milliseconds without an announce
    pub peer_ttl_ms: u64,

    /// Dial timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Explicit announce destinations ("host:port"); empty = subnet broadcast
    #[serde(default)]
    pub announce_targets: Vec<String>,
}

/// Direct-link transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectSettings {
    /// Enable the direct-link transport
    pub enabled: bool,

    /// TCP port the group owner listens on
    pub port: u16,

    /// Dial timeout for clients in milliseconds
    pub connect_timeout_ms: u64,

    /// Role when no platform group service is present: auto, owner, client
    pub role: String,

    /// Group owner address used by clients ("host" or "host:port")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_addr: Option<String>,
}

/// Proximity clustering transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Enable the clustering transport (needs a platform SDK)
    pub enabled: bool,

    /// Service identifier advertised to nearby devices
    pub service_id: String,

    /// Maximum number of connected endpoints
    pub max_peers: usize,
}

/// Session coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Number of recent message ids remembered for deduplication
    pub dedup_window: usize,

    /// Quiet period before a local note edit is broadcast (milliseconds)
    pub note_debounce_ms: u64,

    /// Capacity of the transport and observer event channels
    pub event_buffer: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0".to_string(),
            data_port: 47800,
            discovery_port: 47801,
            announce_interval_ms: 2000,
            peer_ttl_ms: 6000,
            connect_timeout_ms: 3000,
            announce_targets: vec![],
        }
    }
}

impl Default for DirectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 47888,
            connect_timeout_ms: 3500,
            role: "auto".to_string(),
            owner_addr: None,
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_id: "meshnote".to_string(),
            max_peers: 20,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dedup_window: 300,
            note_debounce_ms: 400,
            event_buffer: 256,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl LanSettings {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl DirectSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SessionSettings {
    pub fn note_debounce(&self) -> Duration {
        Duration::from_millis(self.note_debounce_ms)
    }
}

impl MeshConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: e.to_string(),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();

        if let Some(ref file) = config.logging.file {
            config.logging.file = Some(expand_path(file));
        }

        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        let search_paths = [
            PathBuf::from("meshnote.toml"),
            dirs::config_dir()
                .map(|p| p.join("meshnote").join("meshnote.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".meshnote").join("meshnote.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/meshnote/meshnote.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MESHNOTE_NODE_ID") {
            self.node.id = Some(val);
        }
        if let Ok(val) = std::env::var("MESHNOTE_NODE_NAME") {
            self.node.name = Some(val);
        }
        if let Ok(val) = std::env::var("MESHNOTE_HOST_PREFERRED") {
            self.node.host_preferred = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("MESHNOTE_LAN_ENABLED") {
            self.lan.enabled = parse_flag(&val);
        }
        if let Some(n) = env_number("MESHNOTE_LAN_DATA_PORT") {
            self.lan.data_port = n;
        }
        if let Some(n) = env_number("MESHNOTE_LAN_DISCOVERY_PORT") {
            self.lan.discovery_port = n;
        }

        if let Ok(val) = std::env::var("MESHNOTE_DIRECT_ENABLED") {
            self.direct.enabled = parse_flag(&val);
        }
        if let Ok(val) = std::env::var("MESHNOTE_DIRECT_ROLE") {
            self.direct.role = val;
        }
        if let Ok(val) = std::env::var("MESHNOTE_DIRECT_OWNER_ADDR") {
            self.direct.owner_addr = Some(val);
        }

        if let Ok(val) = std::env::var("MESHNOTE_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("MESHNOTE_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("MESHNOTE_LOG_JSON") {
            self.logging.json_format = parse_flag(&val);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.lan.enabled {
            if self.lan.discovery_port == 0 {
                return Err(Error::config_field_invalid(
                    "lan.discovery_port",
                    "discovery_port must be a fixed port so peers can find each other",
                ));
            }
            if self.lan.announce_interval_ms == 0 {
                return Err(Error::config_field_invalid(
                    "lan.announce_interval_ms",
                    "announce_interval_ms must be greater than zero",
                ));
            }
            if self.lan.peer_ttl_ms <= self.lan.announce_interval_ms {
                return Err(Error::config_field_invalid(
                    "lan.peer_ttl_ms",
                    "peer_ttl_ms must be longer than announce_interval_ms",
                ));
            }
        }

        let valid_roles = ["auto", "owner", "client"];
        if !valid_roles.contains(&self.direct.role.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "direct.role",
                format!(
                    "Invalid role '{}'. Must be one of: {}",
                    self.direct.role,
                    valid_roles.join(", ")
                ),
            ));
        }

        if self.cluster.max_peers == 0 {
            return Err(Error::config_field_invalid(
                "cluster.max_peers",
                "max_peers must be at least 1",
            ));
        }

        if self.session.dedup_window == 0 {
            return Err(Error::config_field_invalid(
                "session.dedup_window",
                "dedup_window must be at least 1",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Display name to announce, falling back to the hostname
    pub fn display_name(&self) -> String {
        self.node.name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "meshnote".to_string())
        })
    }
}

fn parse_flag(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".meshnote")
                .join("meshnote.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, DEFAULT_CONFIG).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Default configuration file content with comments
const DEFAULT_CONFIG: &str = r#"# meshnote configuration

[node]
# Fixed identity (a fresh one is generated per session when unset)
# id = "phone-a"

# Display name shown to peers (defaults to the hostname)
# name = "Kitchen tablet"

# Ask for the group-owner role on the direct-link transport
host_preferred = false

[lan]
enabled = true
bind_addr = "0.0.0.0"

# TCP port for peer connections
data_port = 47800

# UDP port for announces
discovery_port = 47801

announce_interval_ms = 2000

# Forget peers after three missed announces
peer_ttl_ms = 6000

connect_timeout_ms = 3000

# Explicit announce destinations; empty means subnet broadcast
announce_targets = []

[direct]
enabled = false
port = 47888
connect_timeout_ms = 3500

# auto, owner or client
role = "auto"

# Group owner address used by clients
# owner_addr = "192.168.49.1"

[cluster]
# Needs a platform proximity SDK
enabled = false
service_id = "meshnote"
max_peers = 20

[session]
dedup_window = 300
note_debounce_ms = 400
event_buffer = 256

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.meshnote/logs/meshnote.log"

max_file_size_mb = 100
max_files = 5
json_format = false
"#;
