//! Non-volatile settings. Writes are staged and become durable when
//! `commit()` returns; staged values are visible to reads immediately.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Marker key written once the unit defaults have been stored.
pub const INITIALIZED_KEY: &str = "initialized";

#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;
    async fn stage(&self, key: &str, value: Option<String>) -> Result<()>;
    async fn commit(&self) -> Result<()>;

    async fn read_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.load(key).await? {
            Some(v) => Ok(Some(
                v.parse::<bool>().with_context(|| format!("setting '{key}' is not a bool: {v}"))?,
            )),
            None => Ok(None),
        }
    }

    async fn read_int(&self, key: &str) -> Result<Option<i64>> {
        match self.load(key).await? {
            Some(v) => Ok(Some(
                v.parse::<i64>().with_context(|| format!("setting '{key}' is not an int: {v}"))?,
            )),
            None => Ok(None),
        }
    }

    async fn read_string(&self, key: &str) -> Result<Option<String>> {
        self.load(key).await
    }

    async fn write_bool(&self, key: &str, value: bool) -> Result<()> {
        self.stage(key, Some(value.to_string())).await
    }

    async fn write_int(&self, key: &str, value: i64) -> Result<()> {
        self.stage(key, Some(value.to_string())).await
    }

    async fn write_string(&self, key: &str, value: &str) -> Result<()> {
        self.stage(key, Some(value.to_string())).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.stage(key, None).await
    }
}

/// Write `defaults` the first time a unit starts on empty storage. Returns
/// true when the defaults were written.
pub async fn initialise(store: &dyn Store, defaults: &[(&str, String)]) -> Result<bool> {
    if store.load(INITIALIZED_KEY).await?.is_some() {
        return Ok(false);
    }
    for (key, value) in defaults {
        store.stage(key, Some(value.clone())).await?;
    }
    store.write_bool(INITIALIZED_KEY, true).await?;
    store.commit().await?;
    tracing::info!(keys = defaults.len(), "store: defaults written");
    Ok(true)
}

/// Forget the initialised marker so the defaults are rewritten next start.
pub async fn reset(store: &dyn Store) -> Result<()> {
    store.remove(INITIALIZED_KEY).await?;
    store.commit().await
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    pending: std::sync::Arc<Mutex<BTreeMap<String, Option<String>>>>,
}

impl SqliteStore {
    /// db_url examples:
    /// - "sqlite:/var/lib/observatory/dome.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // A single connection keeps `sqlite::memory:` one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self {
            pool,
            pending: Default::default(),
        })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    fn snapshot_pending(&self) -> BTreeMap<String, Option<String>> {
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.clone()
    }

    fn clear_committed(&self, written: &BTreeMap<String, Option<String>>) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        clear_committed(&mut pending, written);
    }
}

/// Drop staged entries that `written` made durable. A key restaged with a
/// different value while the commit ran stays pending.
fn clear_committed(
    pending: &mut BTreeMap<String, Option<String>>,
    written: &BTreeMap<String, Option<String>>,
) {
    for (key, value) in written {
        if pending.get(key) == Some(value) {
            pending.remove(key);
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let staged = {
            let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.get(key).cloned()
        };
        if let Some(value) = staged {
            return Ok(value);
        }

        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("load '{key}' failed"))?;
        Ok(row.map(|(v,)| v))
    }

    async fn stage(&self, key: &str, value: Option<String>) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.insert(key.to_string(), value);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        // Staged values stay readable until the transaction lands.
        let pending = self.snapshot_pending();
        if pending.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.context("commit: begin failed")?;
        for (key, value) in &pending {
            match value {
                Some(v) => {
                    sqlx::query(
                        "INSERT INTO settings (key, value) VALUES (?, ?) \
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(key)
                    .bind(v)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("commit: write '{key}' failed"))?;
                }
                None => {
                    sqlx::query("DELETE FROM settings WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("commit: delete '{key}' failed"))?;
                }
            }
        }
        tx.commit().await.context("commit failed")?;
        self.clear_committed(&pending);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store. Counts writes per key so callers can check how
/// often a value was persisted.
#[derive(Default)]
pub struct MemoryStore {
    durable: Mutex<HashMap<String, String>>,
    pending: Mutex<BTreeMap<String, Option<String>>>,
    writes: Mutex<HashMap<String, usize>>,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value as of the last commit.
    pub fn durable(&self, key: &str) -> Option<String> {
        let durable = self.durable.lock().unwrap_or_else(|p| p.into_inner());
        durable.get(key).cloned()
    }

    pub fn writes(&self, key: &str) -> usize {
        let writes = self.writes.lock().unwrap_or_else(|p| p.into_inner());
        writes.get(key).copied().unwrap_or(0)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(value) = pending.get(key) {
            return Ok(value.clone());
        }
        Ok(self.durable(key))
    }

    async fn stage(&self, key: &str, value: Option<String>) -> Result<()> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value);
        *self
            .writes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let written = pending.clone();
        let mut durable = self.durable.lock().unwrap_or_else(|p| p.into_inner());
        for (key, value) in &written {
            match value {
                Some(v) => durable.insert(key.clone(), v.clone()),
                None => durable.remove(key),
            };
        }
        clear_committed(&mut pending, &written);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
