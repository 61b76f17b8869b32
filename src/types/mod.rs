//! Core types for backhaul

mod error;

pub use error::{BackhaulError, FanoutErrors, Result};
