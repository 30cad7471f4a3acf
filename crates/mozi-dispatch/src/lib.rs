//! Dispatch kernel: per-session single-writer lanes over the external
//! prompt driver, with cancellation, fallback chains, and inactivity
//! timeouts.

pub mod driver;
pub mod kernel;

pub use driver::{DriverError, PromptDriver, TurnEvent, TurnRequest};
pub use kernel::{
    DispatchKernel, FallbackNotice, KernelConfig, TurnOutcome, TurnSpec, DEFAULT_TURN_TIMEOUT,
};
