//! Category repository. Same write discipline as the product repository,
//! minus attachments: optimistic local row, remote call, outbox fallback.

use chrono::Utc;
use reqwest::Method;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::db::{Db, Table};
use crate::error::SyncError;
use crate::mapper::{normalize_estado, pick_list, pick_object, value_i64, value_str};
use crate::oracle::Connectivity;
use crate::outbox::{self, EntityType, NewEntry, OutboxEntry, OutboxOp};
use crate::productos::{is_temp_id, ListSource, Listing};

const COLLECTION: &str = "v1/categorias/";

/// Local projection of a remote category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCategory {
    pub id: String,
    pub nombre: String,
    pub descripcion: String,
    pub estado: bool,
    pub updated_at: String,
    /// Branch the row belongs to; `None` for rows predating branch scoping.
    pub sucursal_id: Option<i64>,
    pub pending: bool,
    pub temp_id: Option<String>,
    pub pending_op: Option<String>,
    pub last_error: Option<String>,
    pub synced_at: Option<String>,
}

const CATEGORY_COLS: &str = "id, nombre, descripcion, estado, updated_at, sucursal_id, \
     pending_flag, temp_id, pending_op, last_error, synced_at";

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<CachedCategory> {
    Ok(CachedCategory {
        id: row.get(0)?,
        nombre: row.get(1)?,
        descripcion: row.get(2)?,
        estado: row.get::<_, i64>(3)? != 0,
        updated_at: row.get(4)?,
        sucursal_id: row.get(5)?,
        pending: row.get::<_, i64>(6)? != 0,
        temp_id: row.get(7)?,
        pending_op: row.get(8)?,
        last_error: row.get(9)?,
        synced_at: row.get(10)?,
    })
}

fn upsert_category(tx: &rusqlite::Transaction<'_>, c: &CachedCategory) -> Result<(), SyncError> {
    tx.execute(
        "INSERT INTO categories (id, nombre, descripcion, estado, updated_at,
             sucursal_id, pending, pending_flag, temp_id, pending_op, last_error, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
             nombre = excluded.nombre,
             descripcion = excluded.descripcion,
             estado = excluded.estado,
             updated_at = excluded.updated_at,
             sucursal_id = excluded.sucursal_id,
             pending = excluded.pending,
             pending_flag = excluded.pending_flag,
             temp_id = excluded.temp_id,
             pending_op = excluded.pending_op,
             last_error = excluded.last_error,
             synced_at = excluded.synced_at",
        params![
            c.id,
            c.nombre,
            c.descripcion,
            c.estado as i64,
            c.updated_at,
            c.sucursal_id,
            c.pending as i64,
            c.temp_id,
            c.pending_op,
            c.last_error,
            c.synced_at,
        ],
    )?;
    Ok(())
}

pub fn get_cached(db: &Db, id: &str) -> Result<Option<CachedCategory>, SyncError> {
    let conn = db.conn()?;
    let row = conn
        .query_row(
            &format!("SELECT {CATEGORY_COLS} FROM categories WHERE id = ?1"),
            params![id],
            row_to_category,
        )
        .optional()?;
    Ok(row)
}

/// Cached listing in stable id order (numeric ids ascending, temp ids last).
pub fn list_cached(db: &Db) -> Result<Vec<CachedCategory>, SyncError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {CATEGORY_COLS} FROM categories
         ORDER BY (temp_id IS NOT NULL) ASC, CAST(id AS INTEGER) ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], row_to_category)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Cached listing restricted to one branch; unscoped rows are kept so an
/// offline create stays visible.
pub fn list_cached_by_sucursal(
    db: &Db,
    sucursal_id: i64,
) -> Result<Vec<CachedCategory>, SyncError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {CATEGORY_COLS} FROM categories
         WHERE sucursal_id = ?1 OR sucursal_id IS NULL
         ORDER BY (temp_id IS NOT NULL) ASC, CAST(id AS INTEGER) ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map(params![sucursal_id], row_to_category)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Map one API item onto a cached row.
pub fn map_category_from_api(item: &Value) -> Option<CachedCategory> {
    let id = value_str(item, &["id", "pk", "categoria_id"])
        .or_else(|| value_i64(item, &["id", "pk", "categoria_id"]).map(|n| n.to_string()))?;
    Some(CachedCategory {
        id,
        nombre: value_str(item, &["nombre", "name"]).unwrap_or_default(),
        descripcion: value_str(item, &["descripcion", "description"]).unwrap_or_default(),
        estado: item.get("estado").map(normalize_estado).unwrap_or(true),
        updated_at: value_str(item, &["updated_at", "fecha_actualizacion"])
            .unwrap_or_else(|| Utc::now().to_rfc3339()),
        sucursal_id: value_i64(item, &["sucursal_id"]).or_else(|| {
            item.get("sucursal")
                .filter(|s| s.is_object())
                .and_then(|s| value_i64(s, &["id"]))
        }),
        pending: false,
        temp_id: None,
        pending_op: None,
        last_error: None,
        synced_at: Some(Utc::now().to_rfc3339()),
    })
}

/// Partial category form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryForm {
    pub nombre: Option<String>,
    pub descripcion: Option<String>,
    pub estado: Option<bool>,
    pub sucursal_id: Option<i64>,
}

impl CategoryForm {
    pub fn body(&self) -> Value {
        let mut body = serde_json::Map::new();
        if let Some(v) = &self.nombre {
            body.insert("nombre".into(), json!(v.trim()));
        }
        if let Some(v) = &self.descripcion {
            body.insert("descripcion".into(), json!(v.trim()));
        }
        if let Some(v) = self.estado {
            body.insert(
                "estado".into(),
                json!(if v { "Publicado" } else { "Borrador" }),
            );
        }
        if let Some(v) = self.sucursal_id {
            body.insert("sucursal_id".into(), json!(v));
        }
        Value::Object(body)
    }

    fn apply_to(&self, row: &mut CachedCategory) {
        if let Some(v) = &self.nombre {
            row.nombre = v.trim().to_string();
        }
        if let Some(v) = &self.descripcion {
            row.descripcion = v.trim().to_string();
        }
        if let Some(v) = self.estado {
            row.estado = v;
        }
        if let Some(v) = self.sucursal_id {
            row.sucursal_id = Some(v);
        }
    }
}

pub struct CategoriasRepo<A: RemoteApi> {
    db: Arc<Db>,
    api: Arc<A>,
    net: Arc<dyn Connectivity>,
    sucursal: Option<i64>,
}

impl<A: RemoteApi> CategoriasRepo<A> {
    pub fn new(db: Arc<Db>, api: Arc<A>, net: Arc<dyn Connectivity>) -> Self {
        Self {
            db,
            api,
            net,
            sucursal: None,
        }
    }

    /// Scope the repository to one branch.
    pub fn with_sucursal(mut self, sucursal_id: i64) -> Self {
        self.sucursal = Some(sucursal_id);
        self
    }

    fn cached(&self) -> Result<Vec<CachedCategory>, SyncError> {
        match self.sucursal {
            Some(s) => list_cached_by_sucursal(&self.db, s),
            None => list_cached(&self.db),
        }
    }

    fn collection_path(&self) -> String {
        match self.sucursal {
            Some(s) => format!("{COLLECTION}?sucursal_id={s}"),
            None => COLLECTION.to_string(),
        }
    }

    /// All categories, active and drafts. Online: fetch and reconcile;
    /// otherwise serve the cache.
    pub async fn list_all(&self) -> Result<Listing<CachedCategory>, SyncError> {
        if !self.net.is_online() {
            return Ok(Listing {
                items: self.cached()?,
                source: ListSource::Cache,
            });
        }
        let path = self.collection_path();
        match self.api.request(Method::GET, &path, None, None).await {
            Ok(res) => {
                self.reconcile(&pick_list(&res))?;
                Ok(Listing {
                    items: self.cached()?,
                    source: ListSource::Remote,
                })
            }
            Err(e @ (SyncError::Storage(_) | SyncError::StorePoisoned)) => Err(e),
            Err(e) => {
                warn!("category fetch failed, serving cache: {}", e.user_message());
                Ok(Listing {
                    items: self.cached()?,
                    source: ListSource::Cache,
                })
            }
        }
    }

    /// Published categories only (the menu picker).
    pub async fn list(&self) -> Result<Listing<CachedCategory>, SyncError> {
        let mut listing = self.list_all().await?;
        listing.items.retain(|c| c.estado);
        Ok(listing)
    }

    fn reconcile(&self, items: &[Value]) -> Result<(), SyncError> {
        let mapped: Vec<CachedCategory> =
            items.iter().filter_map(map_category_from_api).collect();
        let remote_ids: HashSet<&str> = mapped.iter().map(|c| c.id.as_str()).collect();

        self.db.with_tx(Table::Categories, |tx| {
            for c in &mapped {
                let pending: Option<i64> = tx
                    .query_row(
                        "SELECT pending_flag FROM categories WHERE id = ?1",
                        params![c.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if pending == Some(1) {
                    continue;
                }
                upsert_category(tx, c)?;
            }

            // A branch-scoped fetch only evicts rows of that branch.
            let local_ids: Vec<String> = match self.sucursal {
                Some(s) => {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM categories
                         WHERE pending_flag = 0 AND temp_id IS NULL AND sucursal_id = ?1",
                    )?;
                    let ids = stmt
                        .query_map(params![s], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    ids
                }
                None => {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM categories WHERE pending_flag = 0 AND temp_id IS NULL",
                    )?;
                    let ids = stmt
                        .query_map([], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    ids
                }
            };
            for id in local_ids {
                if !remote_ids.contains(id.as_str()) {
                    tx.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
                }
            }
            Ok(())
        })
    }

    /// Create a category with the optimistic-then-enqueue discipline.
    pub async fn create(&self, form: &CategoryForm) -> Result<CachedCategory, SyncError> {
        if form.nombre.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(SyncError::Validation("El nombre es obligatorio".into()));
        }

        // A scoped repo files creates under its branch unless the form
        // names one explicitly.
        let mut form = form.clone();
        if form.sucursal_id.is_none() {
            form.sucursal_id = self.sucursal;
        }
        let form = &form;

        let temp_id = format!("tmp-{}", uuid::Uuid::new_v4());
        let mut provisional = CachedCategory {
            id: temp_id.clone(),
            nombre: String::new(),
            descripcion: String::new(),
            estado: true,
            updated_at: Utc::now().to_rfc3339(),
            sucursal_id: self.sucursal,
            pending: true,
            temp_id: Some(temp_id.clone()),
            pending_op: Some("create".into()),
            last_error: None,
            synced_at: None,
        };
        form.apply_to(&mut provisional);
        self.db
            .with_tx(Table::Categories, |tx| upsert_category(tx, &provisional))?;

        if !self.net.is_online() {
            self.enqueue_create(&temp_id, form)?;
            return Ok(provisional);
        }

        match self
            .api
            .request(Method::POST, COLLECTION, Some(&form.body()), None)
            .await
        {
            Ok(res) => self.commit_created(&temp_id, &res),
            Err(e) if e.should_enqueue() => {
                info!("category create deferred to outbox: {}", e.user_message());
                self.enqueue_create(&temp_id, form)?;
                Ok(provisional)
            }
            Err(e) => {
                self.db.with_tx(Table::Categories, |tx| {
                    tx.execute("DELETE FROM categories WHERE id = ?1", params![temp_id])?;
                    Ok(())
                })?;
                Err(e)
            }
        }
    }

    fn enqueue_create(&self, temp_id: &str, form: &CategoryForm) -> Result<OutboxEntry, SyncError> {
        outbox::enqueue(
            &self.db,
            NewEntry {
                entity_type: EntityType::Category,
                op: OutboxOp::Create,
                payload: json!({ "body": form.body() }),
                temp_id: Some(temp_id.to_string()),
                target_id: None,
            },
        )
    }

    fn commit_created(&self, temp_id: &str, res: &Value) -> Result<CachedCategory, SyncError> {
        let obj = pick_object(res);
        let created = map_category_from_api(&obj)
            .ok_or_else(|| SyncError::transport("Respuesta del servidor sin categoria"))?;
        self.db.with_tx(Table::Categories, |tx| {
            tx.execute("DELETE FROM categories WHERE id = ?1", params![temp_id])?;
            upsert_category(tx, &created)?;
            Ok(())
        })?;
        Ok(created)
    }

    /// Update a category; terminal failures restore the previous row.
    pub async fn update(&self, id: &str, form: &CategoryForm) -> Result<CachedCategory, SyncError> {
        let previous = get_cached(&self.db, id)?
            .ok_or_else(|| SyncError::Validation("Categoria no encontrada".into()))?;

        let mut merged = previous.clone();
        form.apply_to(&mut merged);
        merged.updated_at = Utc::now().to_rfc3339();
        merged.pending = true;
        if merged.pending_op.as_deref() != Some("create") {
            merged.pending_op = Some("update".into());
        }
        self.db
            .with_tx(Table::Categories, |tx| upsert_category(tx, &merged))?;

        if is_temp_id(id) || !self.net.is_online() {
            self.enqueue_update(id, form)?;
            return Ok(merged);
        }

        let path = format!("{COLLECTION}{id}/");
        match self
            .api
            .request(Method::PATCH, &path, Some(&form.body()), None)
            .await
        {
            Ok(res) => {
                let obj = pick_object(&res);
                let confirmed = map_category_from_api(&obj).unwrap_or_else(|| {
                    let mut m = merged.clone();
                    m.pending = false;
                    m.pending_op = None;
                    m.synced_at = Some(Utc::now().to_rfc3339());
                    m
                });
                self.db
                    .with_tx(Table::Categories, |tx| upsert_category(tx, &confirmed))?;
                Ok(confirmed)
            }
            Err(e) if e.should_enqueue() => {
                info!("category update deferred to outbox: {}", e.user_message());
                self.enqueue_update(id, form)?;
                Ok(merged)
            }
            Err(e) => {
                self.db
                    .with_tx(Table::Categories, |tx| upsert_category(tx, &previous))?;
                Err(e)
            }
        }
    }

    fn enqueue_update(&self, id: &str, form: &CategoryForm) -> Result<OutboxEntry, SyncError> {
        outbox::enqueue(
            &self.db,
            NewEntry {
                entity_type: EntityType::Category,
                op: OutboxOp::Update,
                payload: json!({ "body": form.body() }),
                temp_id: None,
                target_id: Some(id.to_string()),
            },
        )
    }

    /// Delete a category. Same rollback rules as products.
    pub async fn remove(&self, id: &str, hard: bool) -> Result<(), SyncError> {
        let previous = match get_cached(&self.db, id)? {
            Some(c) => c,
            None => return Ok(()),
        };

        self.db.with_tx(Table::Categories, |tx| {
            tx.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
            Ok(())
        })?;

        if is_temp_id(id) {
            let discarded = {
                let conn = self.db.conn()?;
                conn.execute(
                    "DELETE FROM outbox
                     WHERE (temp_id = ?1 OR target_id = ?1)
                       AND status IN ('pending', 'error')",
                    params![id],
                )?
            };
            if discarded > 0 {
                debug!(id, discarded, "cancelled queued mutations for temp category");
                self.db.notify(Table::Outbox);
            }
            return Ok(());
        }

        if !self.net.is_online() {
            self.enqueue_delete(id, hard)?;
            return Ok(());
        }

        match self
            .api
            .request(Method::DELETE, &delete_path(id, hard), None, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(SyncError::Api {
                status: Some(404), ..
            }) => Ok(()),
            Err(e) if e.should_enqueue() => {
                info!("category delete deferred to outbox: {}", e.user_message());
                self.enqueue_delete(id, hard)?;
                Ok(())
            }
            Err(e) => {
                self.db
                    .with_tx(Table::Categories, |tx| upsert_category(tx, &previous))?;
                Err(e)
            }
        }
    }

    /// Hard delete: skips the backend's soft-delete entirely.
    pub async fn destroy(&self, id: &str) -> Result<(), SyncError> {
        self.remove(id, true).await
    }

    fn enqueue_delete(&self, id: &str, hard: bool) -> Result<OutboxEntry, SyncError> {
        outbox::enqueue(
            &self.db,
            NewEntry {
                entity_type: EntityType::Category,
                op: OutboxOp::Delete,
                payload: json!({ "hard": hard }),
                temp_id: None,
                target_id: Some(id.to_string()),
            },
        )
    }

    /// Replay one queued category mutation.
    pub async fn process_outbox_entry(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
        match entry.op {
            OutboxOp::Create => {
                let body = entry.payload.get("body").cloned().unwrap_or(Value::Null);
                let res = self
                    .api
                    .request(
                        Method::POST,
                        COLLECTION,
                        Some(&body),
                        Some(&entry.idempotency_key),
                    )
                    .await?;
                let temp_id = entry.temp_id.as_deref().unwrap_or_default();
                let created = self.commit_created(temp_id, &res)?;
                if !temp_id.is_empty() {
                    outbox::remap_target(&self.db, temp_id, &created.id)?;
                }
                Ok(())
            }
            OutboxOp::Update => {
                let id = entry.target_id.as_deref().ok_or_else(|| {
                    SyncError::UnsupportedEntry("category update sin target".into())
                })?;
                if is_temp_id(id) {
                    return Err(SyncError::Offline);
                }
                let body = entry.payload.get("body").cloned().unwrap_or(Value::Null);
                let path = format!("{COLLECTION}{id}/");
                let res = self
                    .api
                    .request(Method::PATCH, &path, Some(&body), None)
                    .await?;
                let obj = pick_object(&res);
                if let Some(confirmed) = map_category_from_api(&obj) {
                    self.db
                        .with_tx(Table::Categories, |tx| upsert_category(tx, &confirmed))?;
                } else {
                    self.db.with_tx(Table::Categories, |tx| {
                        tx.execute(
                            "UPDATE categories
                             SET pending = 0, pending_flag = 0, pending_op = NULL,
                                 last_error = NULL, synced_at = ?2
                             WHERE id = ?1",
                            params![id, Utc::now().to_rfc3339()],
                        )?;
                        Ok(())
                    })?;
                }
                Ok(())
            }
            OutboxOp::Delete => {
                let id = entry.target_id.as_deref().ok_or_else(|| {
                    SyncError::UnsupportedEntry("category delete sin target".into())
                })?;
                let hard = entry
                    .payload
                    .get("hard")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                match self
                    .api
                    .request(Method::DELETE, &delete_path(id, hard), None, None)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(SyncError::Api {
                        status: Some(404), ..
                    }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            other => Err(SyncError::UnsupportedEntry(format!(
                "category {}",
                other.as_str()
            ))),
        }
    }
}

fn delete_path(id: &str, hard: bool) -> String {
    if hard {
        format!("{COLLECTION}{id}/?hard=1")
    } else {
        format!("{COLLECTION}{id}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::FlagOracle;
    use crate::test_support::MockApi;

    fn repo(api: MockApi, online: bool) -> CategoriasRepo<MockApi> {
        CategoriasRepo::new(
            Arc::new(Db::open_in_memory().unwrap()),
            Arc::new(api),
            Arc::new(FlagOracle::new(online, true)),
        )
    }

    fn server_category(id: &str, nombre: &str, estado: &str) -> Value {
        json!({ "id": id, "nombre": nombre, "estado": estado })
    }

    #[tokio::test]
    async fn test_list_filters_drafts_list_all_keeps_them() {
        let api = MockApi::ok(json!({
            "results": [
                server_category("2", "Bebidas", "Publicado"),
                server_category("1", "Tacos", "Publicado"),
                server_category("3", "Temporada", "Borrador"),
            ]
        }));
        let repo = repo(api, true);

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.items.len(), 3);
        let ids: Vec<&str> = all.items.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"], "numeric id order");

        let published = repo.list().await.unwrap();
        assert_eq!(published.items.len(), 2);
        assert!(published.items.iter().all(|c| c.estado));
    }

    #[tokio::test]
    async fn test_create_offline_enqueues_with_temp_id() {
        let repo = repo(MockApi::ok(Value::Null), false);
        let created = repo
            .create(&CategoryForm {
                nombre: Some("Postres".into()),
                ..CategoryForm::default()
            })
            .await
            .unwrap();

        assert!(is_temp_id(&created.id));
        let pending = outbox::list_pending(&repo.db).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_type, EntityType::Category);
        assert_eq!(pending[0].op, OutboxOp::Create);
    }

    #[tokio::test]
    async fn test_temp_categories_sort_after_numeric_ids() {
        let api = MockApi::ok(json!({
            "results": [
                server_category("2", "Bebidas", "Publicado"),
                server_category("10", "Tacos", "Publicado"),
            ]
        }));
        let repo = repo(api, true);
        repo.list_all().await.unwrap();

        let offline = Arc::new(FlagOracle::new(false, true));
        let repo2 = CategoriasRepo::new(repo.db.clone(), repo.api.clone(), offline);
        let created = repo2
            .create(&CategoryForm {
                nombre: Some("Postres".into()),
                ..CategoryForm::default()
            })
            .await
            .unwrap();

        let cached = list_cached(&repo.db).unwrap();
        let ids: Vec<&str> = cached.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "10", created.id.as_str()], "temp ids sort last");
    }

    #[tokio::test]
    async fn test_branch_scoped_list_all_filters_and_spares_other_branches() {
        let mut c1 = server_category("1", "Tacos", "Publicado");
        c1["sucursal_id"] = json!(1);
        let mut c2 = server_category("2", "Bebidas", "Publicado");
        c2["sucursal_id"] = json!(2);

        let api = MockApi::ok(json!({ "results": [c1.clone(), c2] }));
        let repo = repo(api, true);
        repo.list_all().await.unwrap();
        assert_eq!(list_cached(&repo.db).unwrap().len(), 2);

        let api2: Arc<MockApi> = Arc::new(MockApi::ok(json!({ "results": [c1] })));
        let scoped = CategoriasRepo::new(repo.db.clone(), api2.clone(), repo.net.clone())
            .with_sucursal(1);
        let listing = scoped.list_all().await.unwrap();

        assert_eq!(api2.calls()[0].path, "v1/categorias/?sucursal_id=1");
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].sucursal_id, Some(1));
        assert!(
            get_cached(&repo.db, "2").unwrap().is_some(),
            "other branch's row must not be evicted by a scoped fetch"
        );
    }

    #[tokio::test]
    async fn test_update_terminal_failure_restores_row() {
        let api = MockApi::ok(server_category("5", "Postres", "Publicado"));
        let repo = repo(api, true);
        repo.create(&CategoryForm {
            nombre: Some("Postres".into()),
            ..CategoryForm::default()
        })
        .await
        .unwrap();

        let failing: Arc<MockApi> = Arc::new(MockApi::failing(400));
        let repo2 = CategoriasRepo::new(repo.db.clone(), failing, repo.net.clone());
        let err = repo2
            .update(
                "5",
                &CategoryForm {
                    nombre: Some("Dulces".into()),
                    ..CategoryForm::default()
                },
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        let row = get_cached(&repo.db, "5").unwrap().unwrap();
        assert_eq!(row.nombre, "Postres");
        assert!(!row.pending);
    }

    #[tokio::test]
    async fn test_replay_create_remaps_queued_targets() {
        let repo = repo(MockApi::ok(Value::Null), false);
        let created = repo
            .create(&CategoryForm {
                nombre: Some("Postres".into()),
                ..CategoryForm::default()
            })
            .await
            .unwrap();
        repo.update(
            &created.id,
            &CategoryForm {
                descripcion: Some("Dulces de la casa".into()),
                ..CategoryForm::default()
            },
        )
        .await
        .unwrap();

        let entries = outbox::list_pending(&repo.db).unwrap();
        let create_entry = entries
            .iter()
            .find(|e| e.op == OutboxOp::Create)
            .unwrap()
            .clone();

        let online: Arc<MockApi> = Arc::new(MockApi::ok(server_category("9", "Postres", "Publicado")));
        let repo2 = CategoriasRepo::new(repo.db.clone(), online, repo.net.clone());
        repo2.process_outbox_entry(&create_entry).await.unwrap();

        let remaining = outbox::list_pending(&repo.db).unwrap();
        let update_entry = remaining.iter().find(|e| e.op == OutboxOp::Update).unwrap();
        assert_eq!(update_entry.target_id.as_deref(), Some("9"));
        assert!(get_cached(&repo.db, "9").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_retryable_failure_enqueues_delete() {
        let api = MockApi::ok(server_category("5", "Postres", "Publicado"));
        let repo = repo(api, true);
        repo.create(&CategoryForm {
            nombre: Some("Postres".into()),
            ..CategoryForm::default()
        })
        .await
        .unwrap();

        let failing: Arc<MockApi> = Arc::new(MockApi::offline());
        let repo2 = CategoriasRepo::new(repo.db.clone(), failing, repo.net.clone());
        repo2.remove("5", false).await.unwrap();

        assert!(get_cached(&repo.db, "5").unwrap().is_none());
        let pending = outbox::list_pending(&repo.db).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, OutboxOp::Delete);
    }
}
