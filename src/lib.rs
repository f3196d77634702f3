//! normcache: a client-side normalized cache for graph-shaped query results.
//!
//! Server responses arrive as nested JSON trees; this crate flattens them
//! into records keyed by identifier so every entity is stored once, however
//! many queries mention it. Reads re-assemble response-shaped data from the
//! flat store, the diff engine computes the minimal follow-up fetch for
//! whatever is missing, and subscribers hear about exactly the records
//! their reads touched.
//!
//! Three tiers make optimistic UI cheap: `cached` (a disk-hydrated seed),
//! `base` (confirmed server data) and `queued` (the optimistic overlay).
//! Reads compose queued → base → cached; rolling back a mutation rebuilds
//! the overlay from the remaining pending transactions instead of undoing
//! writes one by one.
//!
//! [`CacheEngine`] is the single owning handle; there is no global cache.

pub mod config;
pub mod deferred;
pub mod diff;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod gc;
pub mod mutation;
pub mod query;
pub mod reader;
pub mod sched;
pub mod store;
pub mod tracker;
pub mod writer;

pub use config::CacheConfig;
pub use engine::CacheEngine;
pub use error::{CacheError, Result};
pub use mutation::{
    CommitAction, CommitDispatcher, ErrorRecovery, MutationRequest, OptimisticUpdate,
    TransactionId, TransactionStatus,
};
pub use query::{ConnectionArgs, RootSelection, Selection, SelectionKind};
pub use reader::ReadResult;
pub use store::record::{FieldValue, Record, RecordId};
pub use store::{RecordState, RecordStore, TierKind};
pub use writer::ChangeSet;
