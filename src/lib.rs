pub mod aggregator;
pub mod clock;
pub mod config;
pub mod connection;
pub mod db;
pub mod hub;
pub mod messages;
pub mod store;

use std::sync::Arc;

use crate::db::Database;
use crate::hub::Hub;
use crate::store::ReactionStore;

/// Shared handles passed to every connection, the aggregator, and the
/// HTTP endpoints. The store and hub are the only shared mutable state;
/// the database handle is a cloneable pool.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<ReactionStore>,
    pub hub: Arc<Hub>,
    pub db: Database,
}
