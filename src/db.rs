use crate::NarrativeError;
use crate::schema::MIGRATIONS;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared handle to the single write connection.
pub type DbHandle = Arc<Mutex<Connection>>;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[cfg(unix)]
fn ensure_parent_dir(db_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
        // Only set permissions on dirs we created
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_parent_dir(db_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Apply standard PRAGMAs before migrations.
fn apply_pragmas(conn: &Connection, readonly: bool, busy_timeout_ms: u64) -> Result<(), NarrativeError> {
    conn.pragma_update(None, "busy_timeout", busy_timeout_ms as i64)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    if !readonly {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
    }
    Ok(())
}

pub fn open_db(db_path: &Path) -> Result<Connection, NarrativeError> {
    open_db_with_timeout(db_path, DEFAULT_BUSY_TIMEOUT_MS)
}

pub fn open_db_with_timeout(db_path: &Path, busy_timeout_ms: u64) -> Result<Connection, NarrativeError> {
    ensure_parent_dir(db_path)?;

    let mut conn = Connection::open(db_path)?;
    apply_pragmas(&conn, false, busy_timeout_ms)?;
    MIGRATIONS.to_latest(&mut conn)?;

    #[cfg(unix)]
    {
        if db_path.exists() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    Ok(conn)
}

pub fn open_db_readonly(db_path: &Path) -> Result<Connection, NarrativeError> {
    if !db_path.exists() {
        return Err(NarrativeError::Config(format!(
            "database not found: {}",
            db_path.display()
        )));
    }

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    apply_pragmas(&conn, true, DEFAULT_BUSY_TIMEOUT_MS)?;
    Ok(conn)
}

/// Fresh migrated database living only in memory. Used by tests and embedders
/// that keep progress elsewhere.
pub fn open_memory_db() -> Result<Connection, NarrativeError> {
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    MIGRATIONS.to_latest(&mut conn)?;
    Ok(conn)
}

pub fn into_handle(conn: Connection) -> DbHandle {
    Arc::new(Mutex::new(conn))
}
