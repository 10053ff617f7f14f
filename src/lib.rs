//! Punto Sabor sync core: offline-first write synchronization for the
//! food-truck point of sale.
//!
//! Every mutation is applied to the local SQLite cache first and confirmed
//! against the backend when possible; anything that cannot be confirmed
//! rides in a durable outbox until a drain delivers it. The host
//! application wires three seams: a [`api::RemoteApi`] transport, a
//! [`oracle::Connectivity`] oracle for network state, and a
//! [`oracle::Session`] oracle for auth state, then triggers
//! [`sync::SyncManager::sync_now`] on reconnection, sign-in, app focus or a
//! timer.

pub mod api;
pub mod categorias;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod oracle;
pub mod outbox;
pub mod pedidos;
pub mod productos;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use api::{HttpApi, RemoteApi};
pub use config::SyncConfig;
pub use db::{Db, Table};
pub use error::SyncError;
pub use oracle::{Connectivity, FlagOracle, Session};
pub use outbox::{EntityType, OutboxEntry, OutboxOp, OutboxStatus};
pub use sync::{SyncManager, SyncReport};
