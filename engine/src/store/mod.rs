// In engine/src/store/mod.rs

pub mod custom_models;
pub mod history_entries;
pub mod migrations;

use crate::{DbPool, Error};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use tracing::debug;

/// File name of the local database inside the data directory.
pub const DATABASE_FILE: &str = "odrl-forge.sqlite";

/// Open (creating if needed) the on-disk database under `data_dir` and bring
/// its schema up to date.
pub fn open_pool(data_dir: &Path) -> Result<DbPool, Error> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(DATABASE_FILE);
    let manager = SqliteConnectionManager::file(&db_path)
        .with_init(|conn| conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;"));
    let pool = r2d2::Pool::new(manager)?;
    {
        let mut conn = pool.get()?;
        migrate_db(&mut conn)?;
    }
    debug!(path = %db_path.display(), "opened local store");
    Ok(pool)
}

/// Single-connection in-memory pool, used by tests and by `backend-only`
/// sessions that never touch the disk.
pub fn open_memory_pool() -> Result<DbPool, Error> {
    let manager = SqliteConnectionManager::memory();
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
    {
        let mut conn = pool.get()?;
        migrate_db(&mut conn)?;
    }
    Ok(pool)
}

pub fn migrate_db(conn: &mut Connection) -> Result<(), Error> {
    migrations::runner().to_latest(conn)?;
    Ok(())
}
