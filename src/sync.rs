//! Sync manager: single-flight drain of the outbox.
//!
//! At most one drain runs at a time. A `sync_now` that arrives mid-drain
//! does not start a second one; it raises a flag and the running drain makes
//! one more pass before releasing, so a burst of triggers collapses into at
//! most one extra pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::categorias::CategoriasRepo;
use crate::config::SyncConfig;
use crate::db::Db;
use crate::error::SyncError;
use crate::oracle::{Connectivity, Session};
use crate::outbox::{self, EntityType, OutboxEntry, OutboxStatus, SYNCED_RETENTION};
use crate::pedidos::PedidosRepo;
use crate::productos::ProductosRepo;

/// What a `sync_now` call ended up doing.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    /// True when the call did no work itself (offline, no session, or a
    /// drain was already running and absorbed the request).
    pub skipped: bool,
}

pub struct SyncManager<A: RemoteApi> {
    db: Arc<Db>,
    productos: ProductosRepo<A>,
    categorias: CategoriasRepo<A>,
    pedidos: PedidosRepo<A>,
    net: Arc<dyn Connectivity>,
    session: Arc<dyn Session>,
    retention: Duration,
    syncing: AtomicBool,
    pending_requested: AtomicBool,
}

impl<A: RemoteApi> SyncManager<A> {
    pub fn new(
        db: Arc<Db>,
        api: Arc<A>,
        net: Arc<dyn Connectivity>,
        session: Arc<dyn Session>,
    ) -> Self {
        Self {
            productos: ProductosRepo::new(db.clone(), api.clone(), net.clone()),
            categorias: CategoriasRepo::new(db.clone(), api.clone(), net.clone()),
            pedidos: PedidosRepo::new(db.clone(), api.clone(), net.clone()),
            db,
            net,
            session,
            retention: SYNCED_RETENTION,
            syncing: AtomicBool::new(false),
            pending_requested: AtomicBool::new(false),
        }
    }

    /// Override the retention window for synced entries.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Apply the settings a [`SyncConfig`] carries for the manager.
    pub fn with_config(self, config: &SyncConfig) -> Self {
        self.with_retention(config.retention)
    }

    pub fn productos(&self) -> &ProductosRepo<A> {
        &self.productos
    }

    pub fn categorias(&self) -> &CategoriasRepo<A> {
        &self.categorias
    }

    pub fn pedidos(&self) -> &PedidosRepo<A> {
        &self.pedidos
    }

    /// Drain the outbox now, unless a drain is already running (in which
    /// case the running one picks the request up) or we are offline or
    /// signed out (in which case there is nothing useful to attempt).
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        if !self.net.is_online() || !self.session.has_session() {
            debug!("sync skipped: offline or no session");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.pending_requested.store(true, Ordering::SeqCst);
            debug!("sync already running, coalesced");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        let result = self.drain_loop().await;
        self.syncing.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_loop(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        loop {
            let pass = self.drain_once().await?;
            report.synced += pass.synced;
            report.failed += pass.failed;
            if !self.pending_requested.swap(false, Ordering::SeqCst) {
                break;
            }
            debug!("coalesced sync request, draining again");
        }

        let pruned = outbox::prune_synced(&self.db, self.retention)?;
        if report.synced + report.failed + pruned > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                pruned,
                "sync pass finished"
            );
        }
        Ok(report)
    }

    /// One pass over the queue in insertion order. A failing entry is
    /// marked and skipped; the rest of the queue still drains. Entries
    /// found in `sending` were orphaned by an interrupted drain and are
    /// re-attempted under their original idempotency key.
    async fn drain_once(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        for snapshot in outbox::list_all(&self.db)? {
            // Re-read before dispatch: an earlier replay in this pass may
            // have remapped this entry's target from a temp id to the real
            // one, or the entry may have been removed.
            let Some(entry) = outbox::get(&self.db, snapshot.key)? else {
                continue;
            };
            if entry.status == OutboxStatus::Synced {
                continue;
            }
            outbox::update_status(&self.db, entry.key, OutboxStatus::Sending, None)?;

            match self.process(&entry).await {
                Ok(()) => {
                    outbox::update_status(&self.db, entry.key, OutboxStatus::Synced, None)?;
                    report.synced += 1;
                }
                Err(e @ (SyncError::Storage(_) | SyncError::StorePoisoned)) => return Err(e),
                Err(e) => {
                    warn!(
                        key = entry.key,
                        entity_type = entry.entity_type.as_str(),
                        op = entry.op.as_str(),
                        "outbox entry failed: {}",
                        e.user_message()
                    );
                    outbox::update_status(
                        &self.db,
                        entry.key,
                        OutboxStatus::Error,
                        Some(&e.user_message()),
                    )?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn process(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
        match entry.entity_type {
            EntityType::Product => self.productos.process_outbox_entry(entry).await,
            EntityType::Category => self.categorias.process_outbox_entry(entry).await,
            EntityType::Pedido => self.pedidos.process_outbox_entry(entry).await,
        }
    }

    /// Reset an errored entry to `pending` and drain.
    pub async fn retry_entry(&self, key: i64) -> Result<SyncReport, SyncError> {
        outbox::mark_retry(&self.db, key)?;
        self.sync_now().await
    }

    /// Drop a queued entry without sending it.
    pub fn remove_entry(&self, key: i64) -> Result<(), SyncError> {
        outbox::remove(&self.db, key)
    }

    /// Queue contents for the pending-changes screen.
    pub fn queue(&self) -> Result<Vec<OutboxEntry>, SyncError> {
        outbox::list_all(&self.db)
    }
}
