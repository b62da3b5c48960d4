//! Shared data models for post-flash verification

mod expectation;
mod frame;
mod report;

pub use expectation::*;
pub use frame::*;
pub use report::*;
