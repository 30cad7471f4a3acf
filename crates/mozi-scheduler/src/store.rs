use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use mozi_sessions::SessionKey;

use crate::error::{Result, SchedulerError};
use crate::schedule::compute_next_fire;
use crate::types::{Reminder, ReminderPayload, ReminderSchedule};

/// Persisted reminder rows behind a shared SQLite connection.
///
/// The engine and the `/reminders` command branch both hold the store;
/// writes poke `wakeup` so the timer loop re-computes its nearest due
/// boundary immediately.
pub struct ReminderStore {
    db: Mutex<Connection>,
    wakeup: Arc<Notify>,
}

impl ReminderStore {
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            wakeup: Arc::new(Notify::new()),
        })
    }

    /// Handle the engine waits on for schedule changes.
    pub fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    pub fn create(
        &self,
        session_key: &SessionKey,
        schedule: ReminderSchedule,
        payload: ReminderPayload,
    ) -> Result<Reminder> {
        let now = Utc::now();
        let next = compute_next_fire(&schedule, now);
        if next.is_none() {
            return Err(SchedulerError::InvalidSchedule(
                "schedule never fires".to_string(),
            ));
        }
        let reminder = Reminder {
            id: Uuid::new_v4().to_string(),
            session_key: session_key.clone(),
            schedule,
            payload,
            enabled: true,
            last_fired_at: None,
            next_fire_at: next,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO reminders
             (id, session_key, schedule, payload, enabled, last_fired_at, next_fire_at,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, NULL, ?5, ?6, ?6)",
            rusqlite::params![
                reminder.id,
                reminder.session_key.as_str(),
                serde_json::to_string(&reminder.schedule)?,
                serde_json::to_string(&reminder.payload)?,
                reminder.next_fire_at.map(|dt| dt.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        drop(db);

        info!(id = %reminder.id, key = %reminder.session_key, "reminder created");
        self.wakeup.notify_one();
        Ok(reminder)
    }

    pub fn get(&self, id: &str) -> Result<Option<Reminder>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, session_key, schedule, payload, enabled, last_fired_at,
                    next_fire_at, created_at, updated_at
             FROM reminders WHERE id = ?1",
            [id],
            row_to_reminder,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// All reminders for a session (or all sessions when `None`),
    /// soonest-firing first.
    pub fn list(&self, session_key: Option<&SessionKey>) -> Result<Vec<Reminder>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_key, schedule, payload, enabled, last_fired_at,
                    next_fire_at, created_at, updated_at
             FROM reminders
             ORDER BY next_fire_at IS NULL, next_fire_at",
        )?;
        let rows = stmt.query_map([], row_to_reminder)?;
        Ok(rows
            .flatten()
            .filter(|r| session_key.map(|k| &r.session_key == k).unwrap_or(true))
            .collect())
    }

    /// Rows due at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_key, schedule, payload, enabled, last_fired_at,
                    next_fire_at, created_at, updated_at
             FROM reminders
             WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1",
        )?;
        let rows = stmt.query_map([now.to_rfc3339()], row_to_reminder)?;
        Ok(rows.flatten().collect())
    }

    /// The soonest enabled fire time, for the timer's sleep boundary.
    pub fn nearest_due(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().unwrap();
        let next: Option<String> = db
            .query_row(
                "SELECT MIN(next_fire_at) FROM reminders
                 WHERE enabled = 1 AND next_fire_at IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap_or(None);
        Ok(next
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Record a firing: stamp `last_fired_at`, reschedule periodic rows,
    /// self-disable exhausted ones.
    pub fn mark_fired(&self, id: &str, fired_at: DateTime<Utc>) -> Result<()> {
        let reminder = self.get(id)?.ok_or_else(|| SchedulerError::NotFound {
            id: id.to_string(),
        })?;
        let next = compute_next_fire(&reminder.schedule, fired_at);
        let enabled = next.is_some();

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE reminders
             SET last_fired_at = ?1, next_fire_at = ?2, enabled = ?3, updated_at = ?1
             WHERE id = ?4",
            rusqlite::params![
                fired_at.to_rfc3339(),
                next.map(|dt| dt.to_rfc3339()),
                enabled as i64,
                id
            ],
        )?;
        Ok(())
    }

    /// Push the next fire time out by `secs` without touching the schedule.
    pub fn snooze(&self, id: &str, secs: u64) -> Result<Reminder> {
        let next = Utc::now() + chrono::Duration::seconds(secs.max(1) as i64);
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE reminders SET next_fire_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![next.to_rfc3339(), Utc::now().to_rfc3339(), id],
        )?;
        drop(db);
        if n == 0 {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        self.wakeup.notify_one();
        Ok(self.get(id)?.expect("row just updated"))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        // Re-arming needs a fresh fire time; a plain disable keeps it.
        let next = if enabled {
            let reminder = self.get(id)?.ok_or_else(|| SchedulerError::NotFound {
                id: id.to_string(),
            })?;
            compute_next_fire(&reminder.schedule, Utc::now())
        } else {
            None
        };

        let db = self.db.lock().unwrap();
        let n = if enabled {
            db.execute(
                "UPDATE reminders SET enabled = 1, next_fire_at = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![next.map(|dt| dt.to_rfc3339()), Utc::now().to_rfc3339(), id],
            )?
        } else {
            db.execute(
                "UPDATE reminders SET enabled = 0, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id],
            )?
        };
        drop(db);
        if n == 0 {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM reminders WHERE id = ?1", [id])?;
        drop(db);
        if n == 0 {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        self.wakeup.notify_one();
        Ok(())
    }
}

fn row_to_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    let key: String = row.get(1)?;
    let schedule_json: String = row.get(2)?;
    let payload_json: String = row.get(3)?;
    let enabled: i64 = row.get(4)?;
    let last: Option<String> = row.get(5)?;
    let next: Option<String> = row.get(6)?;
    let created: String = row.get(7)?;
    let updated: String = row.get(8)?;

    Ok(Reminder {
        id: row.get(0)?,
        session_key: SessionKey::parse(&key),
        schedule: serde_json::from_str(&schedule_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        payload: serde_json::from_str(&payload_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        enabled: enabled != 0,
        last_fired_at: last.and_then(parse_ts),
        next_fire_at: next.and_then(parse_ts),
        created_at: parse_ts(created).unwrap_or_else(Utc::now),
        updated_at: parse_ts(updated).unwrap_or_else(Utc::now),
    })
}

fn parse_ts(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
