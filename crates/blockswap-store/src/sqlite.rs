//! SQLite implementation of the BlockStore trait.
//!
//! rusqlite with bundled SQLite, wrapped in async via
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use blockswap_core::{Block, BlockId};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{BlockStore, PutResult};

/// SQLite-based block store.
///
/// Thread-safe via internal Mutex. All operations run on the blocking pool.
#[derive(Clone)]
pub struct SqliteBlockStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBlockStore {
    /// Open a SQLite database at the given path, creating and migrating it
    /// if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskFailed(format!("connection mutex poisoned: {}", e)))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(format!("spawn_blocking failed: {}", e)))?
    }
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<Block> {
    let id_bytes: Vec<u8> = row.get("block_id")?;
    let data: Vec<u8> = row.get("data")?;
    let id = BlockId::try_from(id_bytes.as_slice()).map_err(|_| {
        rusqlite::Error::InvalidColumnType(0, "block_id".into(), rusqlite::types::Type::Blob)
    })?;
    Ok(Block::with_id(id, data))
}

#[async_trait]
impl BlockStore for SqliteBlockStore {
    async fn put(&self, block: &Block) -> Result<PutResult> {
        block.verify()?;
        let block = block.clone();

        self.run(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO blocks (block_id, data, size, stored_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    block.id().as_bytes().as_slice(),
                    block.data().as_ref(),
                    block.len() as i64,
                    now_millis()
                ],
            )?;
            Ok(if changed == 1 {
                PutResult::Inserted
            } else {
                PutResult::AlreadyExists
            })
        })
        .await
    }

    async fn get(&self, id: &BlockId) -> Result<Block> {
        let id = *id;
        self.run(move |conn| {
            conn.query_row(
                "SELECT block_id, data FROM blocks WHERE block_id = ?1",
                params![id.as_bytes().as_slice()],
                row_to_block,
            )
            .optional()?
            .ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn has(&self, id: &BlockId) -> Result<bool> {
        let id = *id;
        self.run(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM blocks WHERE block_id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn delete(&self, id: &BlockId) -> Result<bool> {
        let id = *id;
        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM blocks WHERE block_id = ?1",
                params![id.as_bytes().as_slice()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn all_ids(&self) -> Result<Vec<BlockId>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT block_id FROM blocks ORDER BY block_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            let mut ids = Vec::new();
            for bytes in rows {
                let bytes = bytes?;
                let id = BlockId::try_from(bytes.as_slice()).map_err(|_| {
                    StoreError::InvalidData(format!("bad block id length {}", bytes.len()))
                })?;
                ids.push(id);
            }
            Ok(ids)
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.run(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}
