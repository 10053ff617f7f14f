//! Product repository: optimistic local writes with outbox fallback.
//!
//! Every mutation lands in the local cache first so the UI can render the
//! result immediately. The remote call follows; on a retryable failure the
//! mutation is enqueued for background delivery, on a terminal failure the
//! optimistic row is rolled back and the error surfaces to the caller.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::Utc;
use reqwest::Method;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::RemoteApi;
use crate::db::{Db, Table};
use crate::error::SyncError;
use crate::mapper::{normalize_estado, normalize_money, pick_list, pick_object, value_f64, value_i64, value_str};
use crate::oracle::Connectivity;
use crate::outbox::{self, EntityType, NewEntry, OutboxEntry, OutboxOp};

const COLLECTION: &str = "v1/productos/";

/// Where a listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListSource {
    Remote,
    Cache,
}

/// Listing plus its provenance, so the UI can show a "datos locales" badge.
#[derive(Debug, Clone)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub source: ListSource,
}

/// Provisional ids carry this prefix until the server assigns a real one.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with("tmp-")
}

fn new_temp_id() -> String {
    format!("tmp-{}", Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Cached rows
// ---------------------------------------------------------------------------

/// Local projection of a remote product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProduct {
    pub id: String,
    pub categoria_id: String,
    pub categoria_nombre: String,
    pub nombre: String,
    pub descripcion: String,
    pub precio_base: f64,
    pub tiempo_preparacion: i64,
    pub estado: bool,
    pub fecha_creacion: String,
    pub imagen_url: String,
    pub updated_at: String,
    /// Branch the row belongs to; `None` for rows predating branch scoping.
    pub sucursal_id: Option<i64>,
    pub pending: bool,
    pub temp_id: Option<String>,
    pub pending_op: Option<String>,
    pub last_error: Option<String>,
    pub synced_at: Option<String>,
}

const PRODUCT_COLS: &str = "id, categoria_id, categoria_nombre, nombre, descripcion, \
     precio_base, tiempo_preparacion, estado, fecha_creacion, imagen_url, updated_at, \
     sucursal_id, pending_flag, temp_id, pending_op, last_error, synced_at";

fn row_to_product(row: &Row<'_>) -> rusqlite::Result<CachedProduct> {
    Ok(CachedProduct {
        id: row.get(0)?,
        categoria_id: row.get(1)?,
        categoria_nombre: row.get(2)?,
        nombre: row.get(3)?,
        descripcion: row.get(4)?,
        precio_base: row.get(5)?,
        tiempo_preparacion: row.get(6)?,
        estado: row.get::<_, i64>(7)? != 0,
        fecha_creacion: row.get(8)?,
        imagen_url: row.get(9)?,
        updated_at: row.get(10)?,
        sucursal_id: row.get(11)?,
        pending: row.get::<_, i64>(12)? != 0,
        temp_id: row.get(13)?,
        pending_op: row.get(14)?,
        last_error: row.get(15)?,
        synced_at: row.get(16)?,
    })
}

fn upsert_product(tx: &rusqlite::Transaction<'_>, p: &CachedProduct) -> Result<(), SyncError> {
    tx.execute(
        "INSERT INTO products (id, categoria_id, categoria_nombre, nombre, descripcion,
             precio_base, tiempo_preparacion, estado, fecha_creacion, imagen_url, updated_at,
             sucursal_id, pending, pending_flag, temp_id, pending_op, last_error, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(id) DO UPDATE SET
             categoria_id = excluded.categoria_id,
             categoria_nombre = excluded.categoria_nombre,
             nombre = excluded.nombre,
             descripcion = excluded.descripcion,
             precio_base = excluded.precio_base,
             tiempo_preparacion = excluded.tiempo_preparacion,
             estado = excluded.estado,
             fecha_creacion = excluded.fecha_creacion,
             imagen_url = excluded.imagen_url,
             updated_at = excluded.updated_at,
             sucursal_id = excluded.sucursal_id,
             pending = excluded.pending,
             pending_flag = excluded.pending_flag,
             temp_id = excluded.temp_id,
             pending_op = excluded.pending_op,
             last_error = excluded.last_error,
             synced_at = excluded.synced_at",
        params![
            p.id,
            p.categoria_id,
            p.categoria_nombre,
            p.nombre,
            p.descripcion,
            p.precio_base,
            p.tiempo_preparacion,
            p.estado as i64,
            p.fecha_creacion,
            p.imagen_url,
            p.updated_at,
            p.sucursal_id,
            p.pending as i64,
            p.temp_id,
            p.pending_op,
            p.last_error,
            p.synced_at,
        ],
    )?;
    Ok(())
}

/// Point lookup in the cache.
pub fn get_cached(db: &Db, id: &str) -> Result<Option<CachedProduct>, SyncError> {
    let conn = db.conn()?;
    let row = conn
        .query_row(
            &format!("SELECT {PRODUCT_COLS} FROM products WHERE id = ?1"),
            params![id],
            row_to_product,
        )
        .optional()?;
    Ok(row)
}

/// Full cached listing, most recently touched first.
pub fn list_cached(db: &Db) -> Result<Vec<CachedProduct>, SyncError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLS} FROM products ORDER BY updated_at DESC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], row_to_product)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Cached listing restricted to one branch. Rows without a branch (local
/// provisional rows included) are kept so an offline create stays visible.
pub fn list_cached_by_sucursal(db: &Db, sucursal_id: i64) -> Result<Vec<CachedProduct>, SyncError> {
    let conn = db.conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRODUCT_COLS} FROM products
         WHERE sucursal_id = ?1 OR sucursal_id IS NULL
         ORDER BY updated_at DESC, id ASC"
    ))?;
    let rows = stmt
        .query_map(params![sucursal_id], row_to_product)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// API mapping
// ---------------------------------------------------------------------------

/// Map one API item onto a cached row. Tolerant of field-name drift across
/// backend versions; items without a usable id are dropped.
pub fn map_product_from_api(item: &Value) -> Option<CachedProduct> {
    let id = value_str(item, &["id", "pk", "producto_id"])
        .or_else(|| value_i64(item, &["id", "pk", "producto_id"]).map(|n| n.to_string()))?;

    let categoria = item.get("categoria").filter(|c| c.is_object());
    let categoria_id = value_str(item, &["categoria_id"])
        .or_else(|| value_i64(item, &["categoria_id"]).map(|n| n.to_string()))
        .or_else(|| {
            categoria.and_then(|c| {
                value_str(c, &["id"]).or_else(|| value_i64(c, &["id"]).map(|n| n.to_string()))
            })
        })
        .unwrap_or_default();
    let categoria_nombre = value_str(item, &["categoria_nombre"])
        .or_else(|| categoria.and_then(|c| value_str(c, &["nombre", "name"])))
        .unwrap_or_default();

    Some(CachedProduct {
        id,
        categoria_id,
        categoria_nombre,
        nombre: value_str(item, &["nombre", "name"]).unwrap_or_default(),
        descripcion: value_str(item, &["descripcion", "description"]).unwrap_or_default(),
        precio_base: value_f64(item, &["precio_base", "precio", "price"]).unwrap_or(0.0),
        tiempo_preparacion: value_i64(item, &["tiempo_preparacion", "tiempo_prep"]).unwrap_or(0),
        estado: item
            .get("estado")
            .map(normalize_estado)
            .unwrap_or(true),
        fecha_creacion: value_str(item, &["fecha_creacion", "created_at"]).unwrap_or_default(),
        imagen_url: value_str(item, &["imagen_url", "imagen", "image"]).unwrap_or_default(),
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

// ---------------------------------------------------------------------------
// Forms and attachments
// ---------------------------------------------------------------------------

/// Partial form: only the fields the caller sets are sent to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductForm {
    pub nombre: Option<String>,
    pub descripcion: Option<String>,
    pub precio_base: Option<f64>,
    pub tiempo_preparacion: Option<i64>,
    pub estado: Option<bool>,
    pub categoria_id: Option<String>,
    pub sucursal_id: Option<i64>,
}

impl ProductForm {
    /// Partial request body. Prices travel as two-decimal strings, the way
    /// the backend serializes its decimal fields.
    pub fn body(&self) -> Value {
        let mut body = serde_json::Map::new();
        if let Some(v) = &self.nombre {
            body.insert("nombre".into(), json!(v.trim()));
        }
        if let Some(v) = &self.descripcion {
            body.insert("descripcion".into(), json!(v.trim()));
        }
        if let Some(v) = self.precio_base {
            body.insert("precio_base".into(), json!(normalize_money(&v.to_string())));
        }
        if let Some(v) = self.tiempo_preparacion {
            body.insert("tiempo_preparacion".into(), json!(v));
        }
        if let Some(v) = self.estado {
            body.insert(
                "estado".into(),
                json!(if v { "Publicado" } else { "Borrador" }),
            );
        }
        if let Some(v) = &self.categoria_id {
            body.insert("categoria_id".into(), json!(v));
        }
        if let Some(v) = self.sucursal_id {
            body.insert("sucursal_id".into(), json!(v));
        }
        Value::Object(body)
    }

    /// Apply the set fields over an existing cached row (optimistic merge).
    fn apply_to(&self, row: &mut CachedProduct) {
        if let Some(v) = &self.nombre {
            row.nombre = v.trim().to_string();
        }
        if let Some(v) = &self.descripcion {
            row.descripcion = v.trim().to_string();
        }
        if let Some(v) = self.precio_base {
            row.precio_base = v;
        }
        if let Some(v) = self.tiempo_preparacion {
            row.tiempo_preparacion = v;
        }
        if let Some(v) = self.estado {
            row.estado = v;
        }
        if let Some(v) = &self.categoria_id {
            row.categoria_id = v.clone();
        }
        if let Some(v) = self.sucursal_id {
            row.sucursal_id = Some(v);
        }
    }
}

/// Image to attach to a product. Embedded base64 in the outbox payload so a
/// queued create survives restarts with its attachment intact.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    fn to_payload(&self) -> Value {
        json!({
            "filename": self.filename,
            "mime": self.mime,
            "data_b64": B64.encode(&self.bytes),
        })
    }

    fn from_payload(v: &Value) -> Result<Option<Self>, SyncError> {
        if v.is_null() {
            return Ok(None);
        }
        let data = match value_str(v, &["data_b64"]) {
            Some(d) => d,
            None => return Ok(None),
        };
        Ok(Some(ImageAttachment {
            filename: value_str(v, &["filename"]).unwrap_or_else(|| "imagen.jpg".into()),
            mime: value_str(v, &["mime"]).unwrap_or_else(|| "image/jpeg".into()),
            bytes: B64.decode(data)?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

pub struct ProductosRepo<A: RemoteApi> {
    db: Arc<Db>,
    api: Arc<A>,
    net: Arc<dyn Connectivity>,
    sucursal: Option<i64>,
}

impl<A: RemoteApi> ProductosRepo<A> {
    pub fn new(db: Arc<Db>, api: Arc<A>, net: Arc<dyn Connectivity>) -> Self {
        Self {
            db,
            api,
            net,
            sucursal: None,
        }
    }

    /// Scope the repository to one branch: listings fetch and serve only
    /// that branch, and creates are filed under it.
    pub fn with_sucursal(mut self, sucursal_id: i64) -> Self {
        self.sucursal = Some(sucursal_id);
        self
    }

    fn cached(&self) -> Result<Vec<CachedProduct>, SyncError> {
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

    /// List products. Online: fetch, reconcile into the cache (rows with a
    /// pending local mutation always win, rows the server no longer knows
    /// are evicted) and serve the merged result. Offline or on a failed
    /// fetch: serve the cache as-is.
    pub async fn list(&self) -> Result<Listing<CachedProduct>, SyncError> {
        if !self.net.is_online() {
            return Ok(Listing {
                items: self.cached()?,
                source: ListSource::Cache,
            });
        }

        let path = self.collection_path();
        match self.api.request(Method::GET, &path, None, None).await {
            Ok(res) => {
                let items = pick_list(&res);
                self.reconcile(&items)?;
                Ok(Listing {
                    items: self.cached()?,
                    source: ListSource::Remote,
                })
            }
            Err(e @ (SyncError::Storage(_) | SyncError::StorePoisoned)) => Err(e),
            Err(e) => {
                warn!("product fetch failed, serving cache: {}", e.user_message());
                Ok(Listing {
                    items: self.cached()?,
                    source: ListSource::Cache,
                })
            }
        }
    }

    /// Merge a fresh server listing into the cache in one transaction.
    fn reconcile(&self, items: &[Value]) -> Result<(), SyncError> {
        let mapped: Vec<CachedProduct> =
            items.iter().filter_map(map_product_from_api).collect();
        let remote_ids: HashSet<&str> = mapped.iter().map(|p| p.id.as_str()).collect();

        self.db.with_tx(Table::Products, |tx| {
            for p in &mapped {
                let pending: Option<i64> = tx
                    .query_row(
                        "SELECT pending_flag FROM products WHERE id = ?1",
                        params![p.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                // A row with an unflushed local mutation wins over the fetch.
                if pending == Some(1) {
                    continue;
                }
                upsert_product(tx, p)?;
            }

            // Evict synced rows the server no longer returns. Provisional
            // rows (temp ids) and pending rows are never evicted here, and
            // a branch-scoped fetch only evicts rows of that branch.
            let local_ids: Vec<String> = match self.sucursal {
                Some(s) => {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM products
                         WHERE pending_flag = 0 AND temp_id IS NULL AND sucursal_id = ?1",
                    )?;
                    let ids = stmt
                        .query_map(params![s], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    ids
                }
                None => {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM products WHERE pending_flag = 0 AND temp_id IS NULL",
                    )?;
                    let ids = stmt
                        .query_map([], |row| row.get(0))?
                        .collect::<Result<Vec<String>, _>>()?;
                    ids
                }
            };
            for id in local_ids {
                if !remote_ids.contains(id.as_str()) {
                    tx.execute("DELETE FROM products WHERE id = ?1", params![id])?;
                }
            }
            Ok(())
        })
    }

    /// Create a product. Writes a provisional row under a temp id, then
    /// attempts the remote create. Offline or retryable failure: the create
    /// is enqueued and the provisional row stays. Terminal failure: the
    /// provisional row is removed and the error propagates.
    pub async fn create(
        &self,
        form: &ProductForm,
        image: Option<ImageAttachment>,
    ) -> Result<CachedProduct, SyncError> {
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

        let temp_id = new_temp_id();
        let now = Utc::now().to_rfc3339();
        let mut provisional = CachedProduct {
            id: temp_id.clone(),
            categoria_id: String::new(),
            categoria_nombre: String::new(),
            nombre: String::new(),
            descripcion: String::new(),
            precio_base: 0.0,
            tiempo_preparacion: 0,
            estado: true,
            fecha_creacion: now.clone(),
            imagen_url: String::new(),
            updated_at: now,
            sucursal_id: self.sucursal,
            pending: true,
            temp_id: Some(temp_id.clone()),
            pending_op: Some("create".into()),
            last_error: None,
            synced_at: None,
        };
        form.apply_to(&mut provisional);
        self.db
            .with_tx(Table::Products, |tx| upsert_product(tx, &provisional))?;

        if !self.net.is_online() {
            self.enqueue_create(&temp_id, form, image.as_ref())?;
            return Ok(provisional);
        }

        match self
            .api
            .request(Method::POST, COLLECTION, Some(&form.body()), None)
            .await
        {
            Ok(res) => {
                let created = self.commit_created(&temp_id, &res)?;
                let created = match image {
                    Some(img) => self.upload_image(created, img).await,
                    None => created,
                };
                Ok(created)
            }
            Err(e) if e.should_enqueue() => {
                info!("product create deferred to outbox: {}", e.user_message());
                self.enqueue_create(&temp_id, form, image.as_ref())?;
                Ok(provisional)
            }
            Err(e) => {
                // Terminal: the provisional row must not linger.
                self.db.with_tx(Table::Products, |tx| {
                    tx.execute("DELETE FROM products WHERE id = ?1", params![temp_id])?;
                    Ok(())
                })?;
                Err(e)
            }
        }
    }

    fn enqueue_create(
        &self,
        temp_id: &str,
        form: &ProductForm,
        image: Option<&ImageAttachment>,
    ) -> Result<OutboxEntry, SyncError> {
        let payload = json!({
            "body": form.body(),
            "imagen": image.map(ImageAttachment::to_payload).unwrap_or(Value::Null),
        });
        outbox::enqueue(
            &self.db,
            NewEntry {
                entity_type: EntityType::Product,
                op: OutboxOp::Create,
                payload,
                temp_id: Some(temp_id.to_string()),
                target_id: None,
            },
        )
    }

    /// Swap the provisional row for the server's version, atomically.
    fn commit_created(&self, temp_id: &str, res: &Value) -> Result<CachedProduct, SyncError> {
        let obj = pick_object(res);
        let created = map_product_from_api(&obj).ok_or_else(|| {
            SyncError::transport("Respuesta del servidor sin producto")
        })?;
        self.db.with_tx(Table::Products, |tx| {
            tx.execute("DELETE FROM products WHERE id = ?1", params![temp_id])?;
            upsert_product(tx, &created)?;
            Ok(())
        })?;
        Ok(created)
    }

    /// Best-effort image upload after a successful create. An upload
    /// failure never fails the create itself.
    async fn upload_image(&self, mut product: CachedProduct, img: ImageAttachment) -> CachedProduct {
        let path = format!("{COLLECTION}{}/imagen/", product.id);
        match self
            .api
            .upload(&path, "imagen", &img.filename, &img.mime, img.bytes)
            .await
        {
            Ok(res) => {
                if let Some(url) = value_str(&pick_object(&res), &["imagen_url", "imagen", "image"])
                {
                    product.imagen_url = url;
                    let _ = self.db.with_tx(Table::Products, |tx| {
                        tx.execute(
                            "UPDATE products SET imagen_url = ?2 WHERE id = ?1",
                            params![product.id, product.imagen_url],
                        )?;
                        Ok(())
                    });
                }
            }
            Err(e) => warn!("image upload failed (kept product): {}", e.user_message()),
        }
        product
    }

    /// Update a product. The merged row is written first; on a terminal
    /// failure the previous row is restored.
    pub async fn update(&self, id: &str, form: &ProductForm) -> Result<CachedProduct, SyncError> {
        let previous = get_cached(&self.db, id)?
            .ok_or_else(|| SyncError::Validation("Producto no encontrado".into()))?;

        let mut merged = previous.clone();
        form.apply_to(&mut merged);
        merged.updated_at = Utc::now().to_rfc3339();
        merged.pending = true;
        // A provisional row keeps its queued create; everything else gets a
        // queued update.
        if merged.pending_op.as_deref() != Some("create") {
            merged.pending_op = Some("update".into());
        }
        self.db
            .with_tx(Table::Products, |tx| upsert_product(tx, &merged))?;

        // The server has never heard of a temp id, so the change rides on
        // the queue until the create lands and the target is remapped.
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
                let confirmed = map_product_from_api(&obj).unwrap_or_else(|| {
                    let mut m = merged.clone();
                    m.pending = false;
                    m.pending_op = None;
                    m.synced_at = Some(Utc::now().to_rfc3339());
                    m
                });
                self.db
                    .with_tx(Table::Products, |tx| upsert_product(tx, &confirmed))?;
                Ok(confirmed)
            }
            Err(e) if e.should_enqueue() => {
                info!("product update deferred to outbox: {}", e.user_message());
                self.enqueue_update(id, form)?;
                Ok(merged)
            }
            Err(e) => {
                self.db
                    .with_tx(Table::Products, |tx| upsert_product(tx, &previous))?;
                Err(e)
            }
        }
    }

    fn enqueue_update(&self, id: &str, form: &ProductForm) -> Result<OutboxEntry, SyncError> {
        outbox::enqueue(
            &self.db,
            NewEntry {
                entity_type: EntityType::Product,
                op: OutboxOp::Update,
                payload: json!({ "body": form.body() }),
                temp_id: None,
                target_id: Some(id.to_string()),
            },
        )
    }

    /// Toggle publication state.
    pub async fn set_estado(&self, id: &str, estado: bool) -> Result<CachedProduct, SyncError> {
        self.update(
            id,
            &ProductForm {
                estado: Some(estado),
                ..ProductForm::default()
            },
        )
        .await
    }

    /// Delete a product. The local row goes away immediately and is only
    /// restored if the server rejects the delete outright. `hard` skips the
    /// backend's soft-delete and removes the record for good.
    pub async fn remove(&self, id: &str, hard: bool) -> Result<(), SyncError> {
        let previous = match get_cached(&self.db, id)? {
            Some(p) => p,
            None => return Ok(()),
        };

        self.db.with_tx(Table::Products, |tx| {
            tx.execute("DELETE FROM products WHERE id = ?1", params![id])?;
            Ok(())
        })?;

        // Deleting a never-synced product just cancels its queued create
        // and anything else aimed at the temp id.
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
                debug!(id, discarded, "cancelled queued mutations for temp product");
                self.db.notify(Table::Outbox);
            }
            return Ok(());
        }

        if !self.net.is_online() {
            self.enqueue_delete(id, hard)?;
            return Ok(());
        }

        let path = delete_path(id, hard);
        match self.api.request(Method::DELETE, &path, None, None).await {
            Ok(_) => Ok(()),
            // Already gone on the server.
            Err(SyncError::Api {
                status: Some(404), ..
            }) => Ok(()),
            Err(e) if e.should_enqueue() => {
                info!("product delete deferred to outbox: {}", e.user_message());
                self.enqueue_delete(id, hard)?;
                Ok(())
            }
            Err(e) => {
                self.db
                    .with_tx(Table::Products, |tx| upsert_product(tx, &previous))?;
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
                entity_type: EntityType::Product,
                op: OutboxOp::Delete,
                payload: json!({ "hard": hard }),
                temp_id: None,
                target_id: Some(id.to_string()),
            },
        )
    }

    /// Replay one queued product mutation against the backend. Called by the
    /// sync manager during a drain; the entry's idempotency key makes a
    /// re-replayed create safe.
    pub async fn process_outbox_entry(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
        match entry.op {
            OutboxOp::Create => self.replay_create(entry).await,
            OutboxOp::Update => self.replay_update(entry).await,
            OutboxOp::Delete => self.replay_delete(entry).await,
            other => Err(SyncError::UnsupportedEntry(format!(
                "product {}",
                other.as_str()
            ))),
        }
    }

    async fn replay_create(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
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

        // Later queued entries still aim at the temp id; point them at the
        // real one so the FIFO replay keeps working.
        if !temp_id.is_empty() {
            outbox::remap_target(&self.db, temp_id, &created.id)?;
        }

        if let Some(img) = entry
            .payload
            .get("imagen")
            .map(ImageAttachment::from_payload)
            .transpose()?
            .flatten()
        {
            self.upload_image(created, img).await;
        }
        Ok(())
    }

    async fn replay_update(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
        let id = entry
            .target_id
            .as_deref()
            .ok_or_else(|| SyncError::UnsupportedEntry("product update sin target".into()))?;
        if is_temp_id(id) {
            // The create ahead of this entry has not landed yet; keep the
            // entry queued without burning an attempt.
            return Err(SyncError::Offline);
        }
        let body = entry.payload.get("body").cloned().unwrap_or(Value::Null);
        let path = format!("{COLLECTION}{id}/");
        let res = self
            .api
            .request(Method::PATCH, &path, Some(&body), None)
            .await?;

        let obj = pick_object(&res);
        if let Some(confirmed) = map_product_from_api(&obj) {
            self.db
                .with_tx(Table::Products, |tx| upsert_product(tx, &confirmed))?;
        } else {
            self.db.with_tx(Table::Products, |tx| {
                tx.execute(
                    "UPDATE products
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

    async fn replay_delete(&self, entry: &OutboxEntry) -> Result<(), SyncError> {
        let id = entry
            .target_id
            .as_deref()
            .ok_or_else(|| SyncError::UnsupportedEntry("product delete sin target".into()))?;
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
}

fn delete_path(id: &str, hard: bool) -> String {
    if hard {
        format!("{COLLECTION}{id}/?hard=1")
    } else {
        format!("{COLLECTION}{id}/")
    }
}
