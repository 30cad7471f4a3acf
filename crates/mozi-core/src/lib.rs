//! Core data model and configuration engine for the Mozi runtime host.
//!
//! Everything here is transport- and model-agnostic: message envelopes,
//! the error taxonomy, the config document store, and small utilities the
//! rest of the workspace shares.

pub mod config;
pub mod duration;
pub mod envfile;
pub mod error;
pub mod routes;
pub mod secrets;
pub mod text;
pub mod types;

pub use error::{MoziError, Result};
