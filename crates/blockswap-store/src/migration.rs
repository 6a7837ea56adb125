//! Schema versioning for the SQLite block store.
//!
//! The schema version lives in SQLite's `user_version` pragma. Step `n` of
//! [`MIGRATIONS`] upgrades a database from version `n` to `n + 1`; pending
//! steps run in one transaction on open.

use rusqlite::{Connection, Transaction};

use crate::error::{Result, StoreError};

/// Upgrade steps, oldest first.
const MIGRATIONS: &[&str] = &[
    // 1: blocks keyed by their BLAKE3 digest
    r#"
    CREATE TABLE blocks (
        block_id  BLOB PRIMARY KEY,
        data      BLOB NOT NULL,
        size      INTEGER NOT NULL,
        stored_at INTEGER NOT NULL
    );
    CREATE INDEX idx_blocks_stored_at ON blocks(stored_at);
    "#,
];

/// Schema version this build writes.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema at `conn` up to [`CURRENT_VERSION`].
///
/// A database already at the current version is left untouched. One written
/// by a newer build is refused rather than guessed at.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let found = schema_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "schema version {found} is newer than supported version {CURRENT_VERSION}"
        )));
    }
    if found == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (step, sql) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        tx.execute_batch(sql)?;
        set_schema_version(&tx, step as u32 + 1)?;
    }
    tx.commit()?;

    tracing::debug!(from = found, to = CURRENT_VERSION, "block store schema upgraded");
    Ok(())
}

pub(crate) fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

fn set_schema_version(tx: &Transaction<'_>, version: u32) -> Result<()> {
    tx.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Wall-clock time as Unix milliseconds, 0 if the clock is before 1970.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_millis() as i64)
}
