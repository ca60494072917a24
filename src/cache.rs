//! SQLite-backed cache for oracle evaluations.
//!
//! Evaluating a response is the expensive step of a run, so every result is
//! memoized under (oracle id, situation id, response id).

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EvaluationCacheKey {
    pub oracle_id: String,
    pub situation_id: String,
    pub response_id: String,
    pub key_hash: String,
}

impl EvaluationCacheKey {
    pub fn new(oracle_id: &str, situation_id: &str, response_id: &str) -> Self {
        let key_hash = hash_fields(&[oracle_id, situation_id, response_id]);
        Self {
            oracle_id: oracle_id.to_string(),
            situation_id: situation_id.to_string(),
            response_id: response_id.to_string(),
            key_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEvaluation {
    /// Quality lost by the response versus the best available, >= 0.
    pub error_magnitude: f64,
    pub best_response: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait EvaluationCache: Send + Sync {
    async fn get(&self, key: &EvaluationCacheKey) -> Result<Option<CachedEvaluation>, CacheError>;
    async fn put(&self, key: &EvaluationCacheKey, value: &CachedEvaluation) -> Result<(), CacheError>;
}

/// In-process cache, for tests and one-shot runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryEvaluationCache {
    entries: Arc<Mutex<HashMap<String, CachedEvaluation>>>,
}

impl MemoryEvaluationCache {
    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EvaluationCache for MemoryEvaluationCache {
    async fn get(&self, key: &EvaluationCacheKey) -> Result<Option<CachedEvaluation>, CacheError> {
        let map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(map.get(&key.key_hash).cloned())
    }

    async fn put(&self, key: &EvaluationCacheKey, value: &CachedEvaluation) -> Result<(), CacheError> {
        let mut map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        map.insert(key.key_hash.clone(), value.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteEvaluationCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEvaluationCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS evaluation_cache (\
               key_hash TEXT PRIMARY KEY,\
               oracle_id TEXT NOT NULL,\
               situation_id TEXT NOT NULL,\
               response_id TEXT NOT NULL,\
               error_magnitude REAL NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;
        ensure_column(&conn, "best_response", "TEXT")?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("FRICTION_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".friction_eval_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || conn.with_conn(f))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn ensure_column(conn: &Connection, name: &str, spec: &str) -> Result<(), CacheError> {
    let mut stmt = conn.prepare("PRAGMA table_info(evaluation_cache)")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col_name: String = row.get(1)?;
        if col_name == name {
            return Ok(());
        }
    }
    let sql = format!("ALTER TABLE evaluation_cache ADD COLUMN {name} {spec}");
    conn.execute(&sql, [])?;
    Ok(())
}

#[async_trait]
impl EvaluationCache for SqliteEvaluationCache {
    async fn get(&self, key: &EvaluationCacheKey) -> Result<Option<CachedEvaluation>, CacheError> {
        let key_hash = key.key_hash.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT error_magnitude, best_response FROM evaluation_cache WHERE key_hash = ?1",
            )?;
            let mut rows = stmt.query(params![key_hash])?;
            if let Some(row) = rows.next()? {
                let entry = CachedEvaluation {
                    error_magnitude: row.get(0)?,
                    best_response: row.get::<_, Option<String>>(1)?,
                };
                conn.execute(
                    "UPDATE evaluation_cache \
                     SET hit_count = hit_count + 1, updated_at = ?1 \
                     WHERE key_hash = ?2",
                    params![now_epoch(), key_hash],
                )?;
                Ok(Some(entry))
            } else {
                Ok(None)
            }
        })
        .await
    }

    async fn put(&self, key: &EvaluationCacheKey, value: &CachedEvaluation) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO evaluation_cache (\
                    key_hash, oracle_id, situation_id, response_id,\
                    error_magnitude, best_response, created_at, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)\
                 ON CONFLICT(key_hash) DO UPDATE SET \
                    error_magnitude = excluded.error_magnitude,\
                    best_response = excluded.best_response,\
                    updated_at = excluded.updated_at",
                params![
                    key.key_hash,
                    key.oracle_id,
                    key.situation_id,
                    key.response_id,
                    value.error_magnitude,
                    value.best_response,
                    now,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub oracle_id: String,
    pub situation_id: String,
    pub response_id: String,
    pub error_magnitude: f64,
    pub best_response: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteEvaluationCache {
    /// Write every row as JSON lines, most recently used first. Returns the
    /// number of rows written.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key_hash, oracle_id, situation_id, response_id, error_magnitude,\n                        best_response, created_at, updated_at, hit_count\n                 FROM evaluation_cache ORDER BY updated_at DESC, key_hash",
            )?;
            let mut rows = stmt.query([])?;
            let mut file = std::fs::File::create(path)?;
            let mut written = 0;
            while let Some(row) = rows.next()? {
                let record = CacheExportRow {
                    key_hash: row.get(0)?,
                    oracle_id: row.get(1)?,
                    situation_id: row.get(2)?,
                    response_id: row.get(3)?,
                    error_magnitude: row.get(4)?,
                    best_response: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                    hit_count: row.get(8)?,
                };
                let line =
                    serde_json::to_string(&record).map_err(|e| CacheError::Serde(e.to_string()))?;
                use std::io::Write;
                writeln!(file, "{line}")?;
                written += 1;
            }
            Ok(written)
        })
        .await
    }

    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.blocking(move |conn| {
            let mut deleted: usize = 0;
            if let Some(days) = max_age_days {
                let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                let removed = conn.execute(
                    "DELETE FROM evaluation_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
                deleted = deleted.saturating_add(removed);
            }

            if let Some(max_rows) = max_rows {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM evaluation_cache", [], |row| row.get(0))?;
                let keep = max_rows as i64;
                if count > keep {
                    let removed = conn.execute(
                        "DELETE FROM evaluation_cache WHERE key_hash IN (\
                            SELECT key_hash FROM evaluation_cache \
                            ORDER BY updated_at DESC, key_hash LIMIT -1 OFFSET ?1\
                         )",
                        params![keep],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }
            }

            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM evaluation_cache", [], |row| row.get(0))?;
            Ok(CachePruneStats {
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
