//! Local SQLite store for the Punto Sabor sync core.
//!
//! Uses rusqlite with WAL mode. Holds the cached entity tables (`products`,
//! `categories`) and the shared `outbox` queue, provides versioned
//! forward-only schema migrations, and broadcasts a change event after every
//! committed write so the UI can re-render lists without polling.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::SyncError;

/// Fixed database file name; the app has always used a single named local
/// database.
pub const DB_FILE: &str = "punto_sabor.db";

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Tables whose committed writes are announced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Products,
    Categories,
    Outbox,
}

/// Handle to the local store.
///
/// All multi-step mutations go through [`Db::with_tx`] so concurrent readers
/// (live UI subscriptions included) never observe a partial state.
pub struct Db {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<Table>,
    pub db_path: Option<PathBuf>,
}

impl Db {
    /// Open the database at `{data_dir}/punto_sabor.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn open(data_dir: &Path) -> Result<Self, SyncError> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join(DB_FILE);
        info!("Opening database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Database open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    // Also remove WAL/SHM files if present
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)?
            }
        };

        run_migrations(&conn)?;
        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
            db_path: Some(db_path),
        })
    }

    /// In-memory store for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&conn)?;
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
            db_path: None,
        })
    }

    /// Lock the connection for a short critical section. Never hold the
    /// guard across an await point.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn.lock().map_err(|_| SyncError::StorePoisoned)
    }

    /// Run `f` inside a single transaction and notify `table` on commit.
    pub fn with_tx<T>(
        &self,
        table: Table,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        drop(conn);
        self.notify(table);
        Ok(out)
    }

    /// Announce a committed write. A no-op when nobody is subscribed.
    pub fn notify(&self, table: Table) {
        let _ = self.changes.send(table);
    }

    /// Subscribe to committed-write notifications (live queries).
    pub fn subscribe(&self) -> broadcast::Receiver<Table> {
        self.changes.subscribe()
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: cached entity tables plus the outbox queue.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        -- products (local projection of the remote collection)
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            categoria_id TEXT NOT NULL DEFAULT '',
            categoria_nombre TEXT NOT NULL DEFAULT '',
            nombre TEXT NOT NULL DEFAULT '',
            descripcion TEXT NOT NULL DEFAULT '',
            precio_base REAL NOT NULL DEFAULT 0,
            tiempo_preparacion INTEGER NOT NULL DEFAULT 0,
            estado INTEGER NOT NULL DEFAULT 1,
            fecha_creacion TEXT NOT NULL DEFAULT '',
            imagen_url TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL,
            pending INTEGER NOT NULL DEFAULT 0,
            temp_id TEXT,
            pending_op TEXT CHECK (pending_op IN ('create', 'update', 'delete')),
            last_error TEXT,
            synced_at TEXT
        );

        -- categories
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            nombre TEXT NOT NULL DEFAULT '',
            descripcion TEXT NOT NULL DEFAULT '',
            estado INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL,
            pending INTEGER NOT NULL DEFAULT 0,
            temp_id TEXT,
            pending_op TEXT CHECK (pending_op IN ('create', 'update', 'delete')),
            last_error TEXT,
            synced_at TEXT
        );

        -- outbox (append-only queue of pending mutations)
        CREATE TABLE IF NOT EXISTS outbox (
            key INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL
                CHECK (entity_type IN ('product', 'category', 'pedido')),
            op TEXT NOT NULL
                CHECK (op IN ('create', 'update', 'delete', 'cash-payment')),
            payload TEXT NOT NULL DEFAULT '{}',
            temp_id TEXT,
            target_id TEXT,
            idempotency_key TEXT UNIQUE NOT NULL,
            ts INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'sending', 'synced', 'error')),
            error TEXT,
            synced_at TEXT
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_products_categoria ON products(categoria_id);
        CREATE INDEX IF NOT EXISTS idx_products_updated_at ON products(updated_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status);
        CREATE INDEX IF NOT EXISTS idx_outbox_ts ON outbox(ts);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        e
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: indexed `pending_flag` mirror of the `pending` boolean.
///
/// The flag is a 0|1 integer so the pending scan can use an index; the
/// backfill derives it from whatever truthy shape old rows carried.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        ALTER TABLE products ADD COLUMN pending_flag INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE categories ADD COLUMN pending_flag INTEGER NOT NULL DEFAULT 0;

        UPDATE products SET pending_flag = CASE WHEN pending != 0 THEN 1 ELSE 0 END;
        UPDATE categories SET pending_flag = CASE WHEN pending != 0 THEN 1 ELSE 0 END;

        CREATE INDEX IF NOT EXISTS idx_products_pending_flag ON products(pending_flag);
        CREATE INDEX IF NOT EXISTS idx_categories_pending_flag ON categories(pending_flag);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (pending_flag mirror)");
    Ok(())
}

/// Migration v3: branch scoping via `sucursal_id`.
fn migrate_v3(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        ALTER TABLE products ADD COLUMN sucursal_id INTEGER;
        ALTER TABLE categories ADD COLUMN sucursal_id INTEGER;

        CREATE INDEX IF NOT EXISTS idx_products_sucursal ON products(sucursal_id);
        CREATE INDEX IF NOT EXISTS idx_categories_sucursal ON categories(sucursal_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        e
    })?;

    info!("Applied migration v3 (sucursal_id branch scoping)");
    Ok(())
}
