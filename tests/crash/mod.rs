//! Crash testing framework for the apply pipeline
//!
//! - Crash injection at deterministic points
//! - Subprocess management
//! - Post-crash validation of the progress markers

pub mod harness;
pub mod scenarios;
pub mod utils;

pub use harness::*;
pub use utils::*;
