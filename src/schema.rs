use rusqlite_migration::{M, Migrations};
use std::sync::LazyLock;

pub static MIGRATIONS: LazyLock<Migrations<'static>> = LazyLock::new(|| {
    Migrations::new(vec![
        M::up(
            "
CREATE TABLE fragments (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL,
    body            TEXT NOT NULL,
    kind            TEXT NOT NULL CHECK (kind IN ('story', 'decision', 'info')),
    active          INTEGER NOT NULL DEFAULT 1,
    choices         TEXT NOT NULL DEFAULT '[]',
    triggers        TEXT NOT NULL DEFAULT '{}',
    required_clues  TEXT NOT NULL DEFAULT '[]',
    created_at      INTEGER NOT NULL DEFAULT (unixepoch('now')),
    updated_at      INTEGER NOT NULL DEFAULT (unixepoch('now'))
);

CREATE TABLE user_progress (
    user_id             TEXT PRIMARY KEY,
    current_fragment_id TEXT REFERENCES fragments(id),
    visited             TEXT NOT NULL DEFAULT '[]',
    completed           TEXT NOT NULL DEFAULT '[]',
    unlocked_clues      TEXT NOT NULL DEFAULT '[]',
    created_at          INTEGER NOT NULL DEFAULT (unixepoch('now')),
    updated_at          INTEGER NOT NULL DEFAULT (unixepoch('now'))
);

CREATE INDEX idx_fragments_active ON fragments(active);
",
        ),
        M::up(
            "
CREATE TABLE points_ledger (
    id          INTEGER PRIMARY KEY,
    user_id     TEXT NOT NULL,
    amount      INTEGER NOT NULL,
    reason      TEXT NOT NULL,
    created_at  INTEGER NOT NULL DEFAULT (unixepoch('now'))
);
CREATE INDEX idx_ledger_user ON points_ledger(user_id);

CREATE TABLE user_achievements (
    user_id     TEXT NOT NULL,
    code        TEXT NOT NULL,
    granted_at  INTEGER NOT NULL DEFAULT (unixepoch('now')),
    PRIMARY KEY (user_id, code)
);

CREATE TABLE mission_progress (
    user_id     TEXT NOT NULL,
    mission     TEXT NOT NULL,
    progress    INTEGER NOT NULL DEFAULT 0,
    updated_at  INTEGER NOT NULL DEFAULT (unixepoch('now')),
    PRIMARY KEY (user_id, mission)
);
",
        ),
    ])
});
