use crate::errors::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// One raw entry of a tenant list, head first when returned by [`QueueStore::list_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub entry_id: String,
    pub payload: Vec<u8>,
}

/// Ordered per-tenant lists of opaque byte strings.
///
/// Single calls are atomic. Ordering between calls for the same tenant is the
/// caller's job (see the task runner).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// All entries of the tenant list in insertion order.
    async fn list_all(&self, tenant: &str) -> Result<Vec<StoredEntry>>;

    /// Append to the tail. Returns the new list length.
    async fn append(&self, tenant: &str, entry_id: &str, payload: &[u8]) -> Result<u64>;

    /// Remove the oldest entry whose payload equals `payload` byte for byte.
    /// Returns false when nothing matched.
    async fn remove_first_match(&self, tenant: &str, payload: &[u8]) -> Result<bool>;

    /// Remove the entry with the given entry id. Returns false when nothing matched.
    async fn remove_by_entry_id(&self, tenant: &str, entry_id: &str) -> Result<bool>;

    async fn len(&self, tenant: &str) -> Result<u64>;
}

/// SQLite-backed list store.
pub struct SqliteQueueStore {
    conn: Connection,
}

impl SqliteQueueStore {
    /// Open (or create) the store at `db_path`.
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(&db_path).await?;
        let store = Self::init(conn).await?;
        info!("Queue store opened at {:?}", db_path);
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS queue_entries (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    entry_id TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    enqueued_at INTEGER DEFAULT (strftime('%s', 'now'))
                )
                "#,
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_tenant_seq ON queue_entries(tenant_id, seq)",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_tenant_entry ON queue_entries(tenant_id, entry_id)",
                [],
            )?;

            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Close the underlying connection. Later calls fail with `StoreUnavailable`.
    pub async fn close(&self) -> Result<()> {
        self.conn.clone().close().await?;
        info!("Queue store closed");
        Ok(())
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn list_all(&self, tenant: &str) -> Result<Vec<StoredEntry>> {
        let tenant = tenant.to_string();

        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT entry_id, payload FROM queue_entries WHERE tenant_id = ?1 ORDER BY seq ASC",
                )?;

                let rows = stmt.query_map([tenant], |row| {
                    Ok(StoredEntry {
                        entry_id: row.get(0)?,
                        payload: row.get(1)?,
                    })
                })?;

                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                Ok(entries)
            })
            .await?;

        Ok(entries)
    }

    async fn append(&self, tenant: &str, entry_id: &str, payload: &[u8]) -> Result<u64> {
        let tenant = tenant.to_string();
        let entry_id = entry_id.to_string();
        let payload = payload.to_vec();

        let len = self
            .conn
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT INTO queue_entries (tenant_id, entry_id, payload) VALUES (?1, ?2, ?3)",
                    rusqlite::params![tenant, entry_id, payload],
                )?;
                let len: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE tenant_id = ?1",
                    [&tenant],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok(len)
            })
            .await?;

        debug!("Appended entry to tenant list (length {})", len);
        Ok(len as u64)
    }

    async fn remove_first_match(&self, tenant: &str, payload: &[u8]) -> Result<bool> {
        let tenant = tenant.to_string();
        let payload = payload.to_vec();

        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute(
                    r#"
                    DELETE FROM queue_entries
                    WHERE seq = (
                        SELECT MIN(seq) FROM queue_entries
                        WHERE tenant_id = ?1 AND payload = ?2
                    )
                    "#,
                    rusqlite::params![tenant, payload],
                )?;
                Ok(removed)
            })
            .await?;

        Ok(removed > 0)
    }

    async fn remove_by_entry_id(&self, tenant: &str, entry_id: &str) -> Result<bool> {
        let tenant = tenant.to_string();
        let entry_id = entry_id.to_string();

        let removed = self
            .conn
            .call(move |conn| {
                let removed = conn.execute(
                    r#"
                    DELETE FROM queue_entries
                    WHERE seq = (
                        SELECT MIN(seq) FROM queue_entries
                        WHERE tenant_id = ?1 AND entry_id = ?2
                    )
                    "#,
                    rusqlite::params![tenant, entry_id],
                )?;
                Ok(removed)
            })
            .await?;

        Ok(removed > 0)
    }

    async fn len(&self, tenant: &str) -> Result<u64> {
        let tenant = tenant.to_string();

        let len = self
            .conn
            .call(move |conn| {
                let len: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE tenant_id = ?1",
                    [tenant],
                    |row| row.get(0),
                )?;
                Ok(len)
            })
            .await?;

        Ok(len as u64)
    }
}
