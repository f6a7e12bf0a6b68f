//! Shared utilities: error handling, logging bootstrap, input parsing.

pub mod error;
pub mod logger;
pub mod parse;

pub use error::{FrameReason, Result, UmdtError};
