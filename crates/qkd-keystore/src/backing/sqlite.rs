use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, trace};

use super::{BackingStore, BackingStoreCounts};
use crate::error::{KeyStoreError, Result};
use crate::types::{KeyId, Psk};

const LINK_ID_CONTEXT: &str = "qkd-keystore 2024 backing store link id v1";

/// SQLite backed key storage.
///
/// Keys for every destination share one `keys` table, partitioned by a link id
/// derived from the destination name. Reservation runs inside an immediate
/// transaction so several processes can share one file.
pub struct SqliteBackingStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteBackingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| KeyStoreError::BackingStore(e.to_string()))?;

        Self::with_pool(pool)
    }

    /// A private database that disappears with the store
    pub fn in_memory() -> Result<Self> {
        // each connection to :memory: is its own database
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .map_err(|e| KeyStoreError::BackingStore(e.to_string()))?;

        Self::with_pool(pool)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        let store = Self { pool };
        let conn = store.conn()?;
        Self::init_schema(&conn)?;
        Ok(store)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS links (
                link_id INTEGER PRIMARY KEY,
                site_b TEXT NOT NULL,
                next_key_id INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS keys (
                link_id INTEGER NOT NULL,
                id INTEGER NOT NULL,
                value BLOB NOT NULL,
                in_use INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (link_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_keys_unused ON keys(link_id, in_use, id);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| KeyStoreError::BackingStore(e.to_string()))
    }
}

/// Stable 64 bit id for a destination name
fn link_id(destination: &str) -> i64 {
    let hash = blake3::derive_key(LINK_ID_CONTEXT, destination.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    i64::from_le_bytes(bytes)
}

impl BackingStore for SqliteBackingStore {
    fn store_keys(&self, destination: &str, keys: &mut Vec<(KeyId, Psk)>) -> Result<()> {
        let link = link_id(destination);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO links (link_id, site_b) VALUES (?1, ?2)",
            params![link, destination],
        )?;

        let mut stored = Vec::with_capacity(keys.len());
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO keys (link_id, id, value) VALUES (?1, ?2, ?3)",
            )?;
            for (key_id, key) in keys.iter() {
                let changed = insert.execute(params![link, *key_id as i64, key.as_bytes()])?;
                stored.push(changed == 1);
            }
        }

        tx.execute(
            "UPDATE links SET next_key_id = MAX(next_key_id,
                (SELECT COALESCE(MAX(id), 0) + 1 FROM keys WHERE link_id = ?1))
             WHERE link_id = ?1",
            params![link],
        )?;
        tx.commit()?;

        let mut accepted = stored.into_iter();
        keys.retain(|_| !accepted.next().unwrap_or(false));
        debug!(destination, remaining = keys.len(), "Stored keys");
        Ok(())
    }

    fn remove_key(&self, destination: &str, key_id: KeyId) -> Result<Option<Psk>> {
        Ok(self.remove_keys(destination, &[key_id])?.pop().map(|(_, key)| key))
    }

    fn remove_keys(&self, destination: &str, key_ids: &[KeyId]) -> Result<Vec<(KeyId, Psk)>> {
        let link = link_id(destination);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut removed = Vec::new();
        {
            let mut select =
                tx.prepare_cached("SELECT value FROM keys WHERE link_id = ?1 AND id = ?2")?;
            let mut delete = tx.prepare_cached("DELETE FROM keys WHERE link_id = ?1 AND id = ?2")?;
            for key_id in key_ids {
                let value: Option<Vec<u8>> = select
                    .query_row(params![link, *key_id as i64], |row| row.get(0))
                    .optional()?;
                if let Some(value) = value {
                    delete.execute(params![link, *key_id as i64])?;
                    removed.push((*key_id, Psk::new(value)));
                }
            }
        }
        tx.commit()?;

        trace!(destination, removed = removed.len(), "Removed keys");
        Ok(removed)
    }

    fn reserve_key(&self, destination: &str) -> Result<Option<KeyId>> {
        let link = link_id(destination);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let key_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM keys WHERE link_id = ?1 AND in_use = 0 ORDER BY id LIMIT 1",
                params![link],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(key_id) = key_id {
            tx.execute(
                "UPDATE keys SET in_use = 1 WHERE link_id = ?1 AND id = ?2",
                params![link, key_id],
            )?;
        }
        tx.commit()?;

        Ok(key_id.map(|id| id as KeyId))
    }

    fn counts(&self, destination: &str) -> Result<BackingStoreCounts> {
        let conn = self.conn()?;
        let available: i64 = conn.query_row(
            "SELECT COUNT(*) FROM keys WHERE link_id = ?1 AND in_use = 0",
            params![link_id(destination)],
            |row| row.get(0),
        )?;

        Ok(BackingStoreCounts {
            available: available as u64,
            remaining_capacity: u64::MAX,
        })
    }

    fn next_key_id(&self, destination: &str) -> Result<KeyId> {
        let conn = self.conn()?;
        let next: Option<i64> = conn
            .query_row(
                "SELECT next_key_id FROM links WHERE link_id = ?1",
                params![link_id(destination)],
                |row| row.get(0),
            )
            .optional()?;

        Ok(next.filter(|id| *id > 0).map(|id| id as KeyId).unwrap_or(1))
    }
}
