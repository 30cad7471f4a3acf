//! Heartbeat ticker and durable reminder engine.

pub mod db;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::SchedulerError;
pub use store::ReminderStore;
pub use types::{Reminder, ReminderPayload, ReminderSchedule, SchedulerDelivery};
