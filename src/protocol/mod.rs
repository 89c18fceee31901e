//! Wire protocol shared by all transports
//!
//! Every transport carries the same JSON envelope. Stream transports add
//! newline framing on top; the clustering SDK delivers whole payloads.

mod envelope;
mod identity;

pub use envelope::*;
pub use identity::*;
