//! Real-time collaborative document editing core.
//!
//! One live document maps to one session controller ([`hub::HubHandle`]),
//! a single-owner actor that serializes every edit, resolves version
//! conflicts, maintains the undo log, and rebroadcasts canonical
//! operations to the other participants. The [`registry::Registry`]
//! lazy-creates controllers, hydrates them from cache or store, and
//! garbage-collects them when the last participant leaves.

pub mod cache;
pub mod hub;
pub mod operation;
pub mod protocol;
pub mod registry;
pub mod store;

pub use cache::*;
pub use hub::*;
pub use operation::*;
pub use protocol::*;
pub use registry::*;
pub use store::*;
