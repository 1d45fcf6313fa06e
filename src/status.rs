use crate::NarrativeError;
use crate::db::open_db_readonly;
use rusqlite::Connection;
use std::path::Path;

pub struct StatusCounts {
    pub active_fragments: i64,
    pub inactive_fragments: i64,
    pub users: i64,
    pub started_users: i64,
    pub points_awarded: i64,
    pub achievements: i64,
}

pub fn count_status(conn: &Connection) -> Result<StatusCounts, NarrativeError> {
    let (active_fragments, inactive_fragments): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(active = 1), 0), COALESCE(SUM(active = 0), 0) FROM fragments",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let (users, started_users): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COUNT(current_fragment_id) FROM user_progress",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let points_awarded: i64 =
        conn.query_row("SELECT COALESCE(SUM(amount), 0) FROM points_ledger", [], |r| r.get(0))?;
    let achievements: i64 =
        conn.query_row("SELECT COUNT(*) FROM user_achievements", [], |r| r.get(0))?;

    Ok(StatusCounts {
        active_fragments,
        inactive_fragments,
        users,
        started_users,
        points_awarded,
        achievements,
    })
}

pub fn handle_status(db_path: &Path) -> Result<(), NarrativeError> {
    if !db_path.exists() {
        eprintln!("narrative: no database at {}", db_path.display());
        return Ok(());
    }

    let db_size = std::fs::metadata(db_path)?.len();
    let wal_path = db_path.with_extension("db-wal");
    let wal_size = std::fs::metadata(&wal_path).map(|m| m.len()).ok();

    let conn = open_db_readonly(db_path)?;
    let counts = count_status(&conn)?;

    match wal_size {
        Some(ws) => eprintln!("narrative: database — {} (+{} WAL)", fmt_size(db_size), fmt_size(ws)),
        None => eprintln!("narrative: database — {}", fmt_size(db_size)),
    }
    eprintln!(
        "narrative: fragments — {} active, {} inactive",
        counts.active_fragments, counts.inactive_fragments
    );
    eprintln!(
        "narrative: users — {} ({} started)",
        counts.users, counts.started_users
    );
    eprintln!("narrative: points awarded — {}", counts.points_awarded);
    eprintln!("narrative: achievements granted — {}", counts.achievements);

    Ok(())
}

fn fmt_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
