use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::ReminderSchedule;

/// Compute the next fire time strictly after `from`.
///
/// `None` means the schedule is exhausted (a one-shot whose instant has
/// passed) or unparseable; unparseable cron expressions are logged and
/// treated as exhausted rather than wedging the timer loop.
pub fn compute_next_fire(
    schedule: &ReminderSchedule,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule {
        ReminderSchedule::At { at } => {
            if *at > from {
                Some(*at)
            } else {
                None
            }
        }

        ReminderSchedule::Every { every_secs } => {
            Some(from + chrono::Duration::seconds((*every_secs).max(1) as i64))
        }

        ReminderSchedule::Cron { expr, tz } => {
            let normalized = normalize_cron(expr);
            let parsed = match cron::Schedule::from_str(&normalized) {
                Ok(s) => s,
                Err(e) => {
                    warn!(expr = %expr, error = %e, "invalid cron expression");
                    return None;
                }
            };
            match tz.as_deref() {
                Some(name) => {
                    let zone: chrono_tz::Tz = match name.parse() {
                        Ok(z) => z,
                        Err(_) => {
                            warn!(tz = %name, "unknown timezone for cron reminder");
                            return None;
                        }
                    };
                    parsed
                        .after(&from.with_timezone(&zone))
                        .next()
                        .map(|dt| dt.with_timezone(&Utc))
                }
                None => parsed.after(&from).next(),
            }
        }
    }
}

/// The cron crate wants a seconds field; accept the common 5-field form by
/// pinning seconds to zero.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}
