//! Replicated bulletin board server core.
//!
//! This crate provides the components for running a small replicated
//! record store over a line-oriented text protocol: the memory-mapped
//! record store, the command parser and session handler, the peer
//! replication coordinator, and the worker pool that services accepted
//! connections.

use std::sync::Arc;

use tokio::sync::RwLock;

pub mod config;
pub mod errors;
pub mod proto;
pub mod replicate;
pub mod server;
pub mod session;
pub mod store;

pub use errors::BoardError;

use crate::config::Config;
use crate::replicate::Peer;
use crate::store::BulletinStore;

/// Shared node state, constructed once at startup and handed by `Arc`
/// to every component.
///
/// The store's reader-writer lock lives here: readers take the shared
/// side per lookup, and a mutating transaction (local commit or inbound
/// `SYNC_ON`) holds the exclusive side across its whole lifetime.  The
/// peer list is fixed for the life of the node; a reload builds a new
/// one.
pub struct Node {
    /// Resolved configuration this node was started with.
    pub config: Config,
    /// The record store and its node-wide lock.
    pub store: Arc<RwLock<BulletinStore>>,
    /// Peers every mutation is propagated to.
    pub peers: Vec<Peer>,
}
