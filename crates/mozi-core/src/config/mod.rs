//! Configuration subsystem: the JSON-with-comments document, its path
//! grammar, mutation primitives, typed schema, and the on-disk store with
//! optimistic concurrency.

pub mod document;
pub mod path;
pub mod schema;
pub mod store;

pub use document::{ConfigOp, REDACTION_SENTINEL};
pub use path::{parse_path, PathSegment};
pub use schema::EffectiveConfig;
pub use store::{ConfigError, ConfigSnapshot, ConfigStore};
