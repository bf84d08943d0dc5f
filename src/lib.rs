//! Store event handler for a decentralized social-graph hub.
//!
//! Every mutation to the hub's message stores is committed together with a
//! totally-ordered log entry in one atomic RocksDB batch, fanned out to
//! in-process subscribers, and folded into a per-account usage cache that
//! answers prune-eligibility queries.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod event_id;
pub mod handler;
pub mod keys;
pub mod logging;
pub mod time;

pub use cache::StorageCache;
pub use config::HubConfig;
pub use db::{HubDb, Transaction};
pub use error::{HubError, Result};
pub use event::{
    EventKind, HubEvent, HubEventBody, Message, OnChainBody, OnChainKind, StoreKind,
    UsernameProofBody,
};
pub use event_id::{EventId, EventIdGenerator};
pub use handler::{EventListener, EventsPage, StoreEventHandler, Usage};
