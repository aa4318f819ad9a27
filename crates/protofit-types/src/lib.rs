//! Shared domain types for the ProtoFit tracker.

pub mod analysis;
pub mod config;
pub mod display;
pub mod events;
pub mod exercise;
pub mod telemetry;
pub mod vision;

mod errors;

pub use errors::{ProtofitError, Result};
