//! flashcheck-core - Core types and traits for post-flash verification
//!
//! This crate provides the data model shared by the diagnostic session and
//! the periodic-traffic monitor (frames, expectations, verdicts, reports),
//! plus the collaborator traits that let the CLI plug in symbol tables,
//! message databases and report writers.

pub mod collaborators;
pub mod error;
pub mod models;

pub use collaborators::{ExpectationLoader, RawExpectation, ReportSink, SymbolResolver};
pub use error::{CollaboratorError, CoreError};
pub use models::*;
