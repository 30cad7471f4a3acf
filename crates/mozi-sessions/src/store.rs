use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use crate::error::{Result, SessionError};
use crate::key::SessionKey;
use crate::types::{meta, Session, SessionAttrs, SessionFilter, SessionStatus};

/// Thread-safe store for persisted sessions.
///
/// Wraps a single SQLite connection in a `Mutex`; every update is
/// write-through, so a restart followed by [`SessionStore::load`]
/// reconstructs exactly what callers last observed.
pub struct SessionStore {
    db: Mutex<Connection>,
}

impl SessionStore {
    /// Wrap an open connection, creating tables if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Log the persisted population on startup and return its size.
    pub fn load(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        info!(sessions = count, "session store loaded");
        Ok(count as usize)
    }

    /// Return the existing session or create it. Idempotent: a second call
    /// with the same key returns the stored row, and only attributes that
    /// were never set may be filled in by `attrs`.
    #[instrument(skip(self, attrs), fields(key = %key))]
    pub fn get_or_create(&self, key: &SessionKey, attrs: SessionAttrs) -> Result<Session> {
        if let Some(existing) = self.get(key)? {
            debug!("session exists");
            // parent_key may be filled once if it was never recorded.
            if existing.parent_key.is_none() {
                if let Some(parent) = attrs.parent_key {
                    let db = self.db.lock().unwrap();
                    db.execute(
                        "UPDATE sessions SET parent_key = ?1 WHERE session_key = ?2 AND parent_key IS NULL",
                        rusqlite::params![parent.as_str(), key.as_str()],
                    )?;
                    drop(db);
                    return Ok(self.get(key)?.expect("row just updated"));
                }
            }
            return Ok(existing);
        }

        let agent_id = attrs
            .agent_id
            .or_else(|| key.agent_id().map(str::to_string))
            .unwrap_or_else(|| crate::key::FALLBACK_AGENT.to_string());
        let now = Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO sessions
             (session_key, agent_id, status, parent_key, context, metadata, created_at, updated_at)
             VALUES (?1, ?2, 'idle', ?3, '[]', '{}', ?4, ?4)",
            rusqlite::params![
                key.as_str(),
                agent_id,
                attrs.parent_key.as_ref().map(|k| k.as_str()),
                now
            ],
        )?;
        drop(db);

        // Read back — covers the race where two lanes insert simultaneously.
        self.get(key)?
            .ok_or_else(|| SessionError::NotFound {
                key: key.as_str().to_string(),
            })
    }

    #[instrument(skip(self), fields(key = %key))]
    pub fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT session_key, agent_id, status, parent_key, context, metadata,
                    created_at, updated_at
             FROM sessions WHERE session_key = ?1",
            rusqlite::params![key.as_str()],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// List sessions matching `filter`, most recently updated first.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT session_key, agent_id, status, parent_key, context, metadata,
                    created_at, updated_at
             FROM sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut out = Vec::new();
        for row in rows.flatten() {
            if let Some(agent) = &filter.agent_id {
                if &row.agent_id != agent {
                    continue;
                }
            }
            if let Some(channel) = &filter.channel {
                if row.key.channel() != Some(channel.as_str()) {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if row.status != status {
                    continue;
                }
            }
            out.push(row);
        }
        Ok(out)
    }

    /// Remove a session. Returns whether a row existed. Callers must have
    /// interrupted any active turn through the kernel first.
    #[instrument(skip(self), fields(key = %key))]
    pub fn delete(&self, key: &SessionKey) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM sessions WHERE session_key = ?1",
            rusqlite::params![key.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Write-through status transition; bumps `updated_at`.
    pub fn set_status(&self, key: &SessionKey, status: SessionStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE session_key = ?3",
            rusqlite::params![status.as_str(), now, key.as_str()],
        )?;
        if n == 0 {
            return Err(SessionError::NotFound {
                key: key.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Merge metadata keys, last writer wins per key. A JSON null deletes.
    pub fn patch_metadata(
        &self,
        key: &SessionKey,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Session> {
        let mut session = self.require(key)?;
        for (k, v) in patch {
            if v.is_null() {
                session.metadata.remove(k);
            } else {
                session.metadata.insert(k.clone(), v.clone());
            }
        }
        let metadata_json = serde_json::to_string(&session.metadata)?;
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET metadata = ?1, updated_at = ?2 WHERE session_key = ?3",
            rusqlite::params![metadata_json, now, key.as_str()],
        )?;
        drop(db);
        self.require(key)
    }

    /// Replace the session context wholesale (write-through).
    pub fn set_context(&self, key: &SessionKey, context: &[serde_json::Value]) -> Result<()> {
        let context_json = serde_json::to_string(context)?;
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE sessions SET context = ?1, updated_at = ?2 WHERE session_key = ?3",
            rusqlite::params![context_json, now, key.as_str()],
        )?;
        if n == 0 {
            return Err(SessionError::NotFound {
                key: key.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Append entries to the session context.
    pub fn append_context(&self, key: &SessionKey, entries: &[serde_json::Value]) -> Result<()> {
        let mut session = self.require(key)?;
        session.context.extend(entries.iter().cloned());
        self.set_context(key, &session.context)
    }

    /// Rotate: archive the current context, clear it, stamp the rotation
    /// metadata. Used by `/new` and the lifecycle rollover checks.
    #[instrument(skip(self), fields(key = %key, rotation))]
    pub fn rotate(&self, key: &SessionKey, rotation: &str) -> Result<()> {
        let session = self.require(key)?;
        let now = Utc::now().to_rfc3339();
        let context_json = serde_json::to_string(&session.context)?;

        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO session_archives (session_key, rotation, context, archived_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key.as_str(), rotation, context_json, now],
            )?;
            db.execute(
                "UPDATE sessions SET context = '[]', updated_at = ?1 WHERE session_key = ?2",
                rusqlite::params![now, key.as_str()],
            )?;
        }

        let mut patch = serde_json::Map::new();
        patch.insert(
            meta::LAST_ROTATION_AT.to_string(),
            serde_json::Value::String(now),
        );
        patch.insert(
            meta::LAST_ROTATION_TYPE.to_string(),
            serde_json::Value::String(rotation.to_string()),
        );
        self.patch_metadata(key, &patch)?;
        info!(key = %key, rotation, "session rotated");
        Ok(())
    }

    /// Bump `updated_at` without other changes.
    pub fn touch(&self, key: &SessionKey) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE session_key = ?2",
            rusqlite::params![now, key.as_str()],
        )?;
        Ok(())
    }

    fn require(&self, key: &SessionKey) -> Result<Session> {
        self.get(key)?.ok_or_else(|| SessionError::NotFound {
            key: key.as_str().to_string(),
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let key_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let parent: Option<String> = row.get(3)?;
    let context_json: String = row.get(4)?;
    let metadata_json: String = row.get(5)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;

    Ok(Session {
        key: SessionKey::parse(&key_str),
        agent_id: row.get(1)?,
        status: status_str.parse().unwrap_or(SessionStatus::Idle),
        parent_key: parent.map(|p| SessionKey::parse(&p)),
        context: serde_json::from_str(&context_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
