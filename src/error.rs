//! Error types for meshnote
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for the CLI
//!
//! Only session start can fail as a whole. Everything that goes wrong on a
//! single connection is logged and turned into a peer event instead.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::mesh::TransportKind;

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,
    IoAddrInUse = 204,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    SelfConnection = 402,

    // Transport / session errors (5xx)
    TransportUnavailable = 500,
    PermissionDenied = 501,
    AllTransportsFailed = 502,
    SessionNotRunning = 503,
    PeerNotConnected = 504,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the mesh
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error (socket bind, accept, ...)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Dial refused or failed
    #[error("Failed to connect to {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// Dial did not complete in time
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    /// Established connection dropped
    #[error("Lost connection to {peer}: {message}")]
    ConnectionLost { peer: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed line or payload
    #[error("Malformed message: {message}")]
    ProtocolMalformed { message: String },

    /// Hello carried our own identity
    #[error("Rejected connection to self ({id})")]
    SelfConnection { id: String },

    // ─────────────────────────────────────────────────────────────
    // Transport / Session Errors
    // ─────────────────────────────────────────────────────────────

    /// Transport cannot run on this device
    #[error("{transport} transport unavailable: {reason}")]
    TransportUnavailable {
        transport: TransportKind,
        reason: String,
    },

    /// Runtime permission was refused
    #[error("Permission denied for {transport} transport")]
    PermissionDenied { transport: TransportKind },

    /// Session start could not bring up a single transport
    #[error("No transport could be started ({})", failures.join("; "))]
    AllTransportsFailed { failures: Vec<String> },

    /// Operation requires a running session
    #[error("Session is not running")]
    SessionNotRunning,

    /// Unicast target is not connected on the transport
    #[error("Peer {peer} is not connected on {transport}")]
    PeerNotConnected {
        peer: String,
        transport: TransportKind,
    },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                std::io::ErrorKind::AddrInUse => ErrorCode::IoAddrInUse,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::SelfConnection { .. } => ErrorCode::SelfConnection,

            Error::TransportUnavailable { .. } => ErrorCode::TransportUnavailable,
            Error::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Error::AllTransportsFailed { .. } => ErrorCode::AllTransportsFailed,
            Error::SessionNotRunning => ErrorCode::SessionNotRunning,
            Error::PeerNotConnected { .. } => ErrorCode::PeerNotConnected,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether a later discovery cycle may succeed where this failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionLost { .. }
                | Error::PeerNotConnected { .. }
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => {
                Some("Run 'meshnote config init' to create a default configuration file.")
            }
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'meshnote config validate' to see details.",
            ),
            Error::ConfigValidation { .. } => {
                Some("Review the configuration file and fix the invalid values.")
            }
            Error::Io(e) if e.kind() == std::io::ErrorKind::AddrInUse => Some(
                "Another meshnote instance may be running. Change [lan] data_port or discovery_port.",
            ),
            Error::ConnectionTimeout { .. } => {
                Some("The peer may have left the network. It will be retried on its next announce.")
            }
            Error::TransportUnavailable { .. } => {
                Some("This transport is not supported here. Other transports keep running.")
            }
            Error::PermissionDenied { .. } => {
                Some("Grant the requested permission and restart the session.")
            }
            Error::AllTransportsFailed { .. } => Some(
                "Check that the network is up and that [lan] or [direct] is enabled in the configuration.",
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            addr: addr.into(),
            message: message.into(),
        }
    }

    /// Create a transport unavailable error
    pub fn unavailable(transport: TransportKind, reason: impl Into<String>) -> Self {
        Error::TransportUnavailable {
            transport,
            reason: reason.into(),
        }
    }
}
