//! `jobvault-core` — shared building blocks for the job storage engine.
//!
//! This crate has no storage concerns: identifiers and argument validation only.

pub mod error;
pub mod id;

pub use error::{ValidationError, ValidationResult, require_finite, require_non_empty};
pub use id::{JobId, LockToken, QueueEntryId};
