use rusqlite::{Connection, Result};

/// Initialise session tables. Idempotent; safe on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_key TEXT PRIMARY KEY,
            agent_id    TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'idle',
            parent_key  TEXT,
            context     TEXT NOT NULL DEFAULT '[]',
            metadata    TEXT NOT NULL DEFAULT '{}',
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_agent
            ON sessions(agent_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS session_archives (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key TEXT NOT NULL,
            rotation    TEXT NOT NULL,
            context     TEXT NOT NULL,
            archived_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_archives_session
            ON session_archives(session_key, archived_at DESC);",
    )
}
