//! meshnote: ad-hoc peer mesh with shared chat and a last-writer-wins note
//!
//! The library holds the mesh coordinator; the binary wraps it in an
//! interactive terminal runner.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod protocol;
pub mod version;

pub use config::MeshConfig;
pub use error::{Error, ErrorCode, Result};
pub use mesh::{SessionCoordinator, SessionEvent, Transport, TransportKind};
pub use protocol::{Envelope, PeerIdentity};
