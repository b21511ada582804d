//! Pooled SQLite store backing the cache engine.
//!
//! Connections are opened lazily up to a fixed bound and recycled through a
//! free-list. Writes run in SQLite's implicit transaction; lock contention
//! is retried with capped exponential backoff.

use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags, Params};

use crate::error::ProxyError;

const MAX_POOL_SIZE: usize = 5;
const MAX_RETRIES: usize = 5;
const RETRY_BASE_DELAY_MS: u64 = 50;
const RETRY_MAX_DELAY_MS: u64 = 1000;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cache_entries (
        fingerprint TEXT PRIMARY KEY,
        domain TEXT NOT NULL,
        status INTEGER NOT NULL,
        headers_blob TEXT NOT NULL,
        payload_blob BLOB NOT NULL,
        compressed INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        ttl_seconds INTEGER NOT NULL,
        last_accessed_at INTEGER NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_cache_domain_created
        ON cache_entries (domain, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_cache_last_accessed
        ON cache_entries (last_accessed_at)",
];

/// Bounded connection pool over a single SQLite database.
pub struct Store {
    path: String,
    use_uri: bool,
    pool: Mutex<Vec<Connection>>,
    // Keeps a shared in-memory database alive across pool churn. Unused for
    // file-backed stores but harmless.
    _anchor: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database, apply pragmas and initialize the
    /// schema. Any failure here is fatal to startup.
    pub fn new(database_path: &str) -> Result<Self, ProxyError> {
        // ":memory:" becomes a process-unique shared-cache URI so the whole
        // pool sees one database while independent stores stay isolated.
        let (path, use_uri) = if database_path == ":memory:" {
            (
                format!(
                    "file:api-buddy-{}?mode=memory&cache=shared",
                    uuid::Uuid::new_v4().simple()
                ),
                true,
            )
        } else {
            (
                database_path.to_string(),
                database_path.starts_with("file:"),
            )
        };

        let anchor = open_connection(&path, use_uri)?;
        let store = Self {
            path,
            use_uri,
            pool: Mutex::new(Vec::new()),
            _anchor: Mutex::new(anchor),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), ProxyError> {
        let conn = self.acquire()?;
        for stmt in SCHEMA {
            conn.execute(stmt, [])?;
        }
        let versions: i64 =
            conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?;
        if versions == 0 {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }
        self.release(conn);
        Ok(())
    }

    fn acquire(&self) -> Result<Connection, ProxyError> {
        if let Some(conn) = self.pool.lock().expect("store pool lock poisoned").pop() {
            return Ok(conn);
        }
        open_connection(&self.path, self.use_uri)
    }

    fn release(&self, conn: Connection) {
        let mut pool = self.pool.lock().expect("store pool lock poisoned");
        if pool.len() < MAX_POOL_SIZE {
            pool.push(conn);
        }
        // Surplus connections are dropped (closed) here.
    }

    /// Run a read-only query, mapping each row through `map_row`.
    pub fn execute_query<T, P, F>(
        &self,
        sql: &str,
        params: P,
        map_row: F,
    ) -> Result<Vec<T>, ProxyError>
    where
        P: Params + Clone,
        F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params.clone(), &map_row)?;
            rows.collect::<rusqlite::Result<Vec<T>>>()
        })
    }

    /// Run a single statement that mutates the database. Constraint
    /// violations are reported as zero affected rows, not as errors.
    pub fn execute_update<P>(&self, sql: &str, params: P) -> Result<usize, ProxyError>
    where
        P: Params + Clone,
    {
        self.with_retry(|conn| match conn.execute(sql, params.clone()) {
            Ok(n) => Ok(n),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        })
    }

    /// Single-value convenience for COUNT/SUM style queries.
    pub fn query_scalar<P>(&self, sql: &str, params: P) -> Result<i64, ProxyError>
    where
        P: Params + Clone,
    {
        self.with_retry(|conn| {
            conn.query_row(sql, params.clone(), |row| row.get::<_, Option<i64>>(0))
                .map(|v| v.unwrap_or(0))
        })
    }

    fn with_retry<T, F>(&self, op: F) -> Result<T, ProxyError>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0;
        loop {
            let conn = self.acquire()?;
            let result = op(&conn);
            self.release(conn);
            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_locked(&e) && attempt + 1 < MAX_RETRIES => {
                    let backoff = (RETRY_BASE_DELAY_MS << attempt).min(RETRY_MAX_DELAY_MS);
                    tracing::debug!("database locked, retrying in {}ms: {}", backoff, e);
                    std::thread::sleep(Duration::from_millis(backoff));
                    attempt += 1;
                }
                Err(e) => return Err(ProxyError::Storage(e)),
            }
        }
    }
}

fn open_connection(path: &str, use_uri: bool) -> Result<Connection, ProxyError> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    if use_uri {
        flags |= OpenFlags::SQLITE_OPEN_URI;
    }
    let conn = Connection::open_with_flags(path, flags)?;
    // WAL keeps readers concurrent with the single writer.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", 10000)?;
    conn.pragma_update(None, "temp_store", "memory")?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(conn)
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}
