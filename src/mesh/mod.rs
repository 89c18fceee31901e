//! Multi-transport peer mesh
//!
//! Three transports (local network, direct link, proximity clustering)
//! implement one [`Transport`] interface; the [`SessionCoordinator`] drives
//! them together and keeps chat and the shared note consistent.

pub mod cluster;
pub mod dedup;
pub mod direct;
pub mod document;
pub mod lan;
pub mod link;
pub mod registry;
pub mod session;
pub mod transport;

pub use cluster::{ClusterEvent, ClusterTransport, NoProximitySdk, ProximitySdk};
pub use dedup::MessageDeduplicator;
pub use direct::{DirectState, DirectTransport, FixedGroupService, GroupEvent, GroupRole, GroupService};
pub use document::{Debouncer, DocumentReplica, DocumentSnapshot};
pub use lan::{LanState, LanTransport};
pub use link::LinkInfo;
pub use session::{
    ChatLine, GrantAll, PermissionBroker, SessionCoordinator, SessionEvent, StatusSnapshot,
};
pub use transport::{
    Direction, LogLevel, Transport, TransportContext, TransportEvent, TransportKind,
    TransportStatus,
};
