//! A content addressed client store with optimistic local mutations and
//! server sync.
//!
//! State lives in a DAG of immutable chunks ([`dag`]) over a key-value
//! database ([`kv`]). Commits ([`db`]) form a chain of local mutations on top
//! of server snapshots. [`sync`] pulls new snapshots and replays pending
//! mutations on top of them, and pushes local mutations out. [`replica`]
//! ties it together for one client.
#![deny(missing_docs)]
#![cfg_attr(syncstore_docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod dag;
pub mod db;
pub mod kv;
pub mod persist;
pub mod recovery;
pub mod replica;
pub mod sync;
pub mod transaction;

pub use self::{
    config::Config,
    replica::{PullOutcome, Replica, ReplicaError},
};
pub use syncstore_base::Hash;
