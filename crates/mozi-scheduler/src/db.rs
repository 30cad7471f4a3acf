use rusqlite::{Connection, Result};

/// Initialise reminder tables. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS reminders (
            id            TEXT PRIMARY KEY,
            session_key   TEXT NOT NULL,
            schedule      TEXT NOT NULL,
            payload       TEXT NOT NULL,
            enabled       INTEGER NOT NULL DEFAULT 1,
            last_fired_at TEXT,
            next_fire_at  TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_reminders_due
            ON reminders(enabled, next_fire_at);",
    )
}
