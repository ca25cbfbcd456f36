//! Job repository: job records, parameters, and state history.
//!
//! ## Components
//!
//! - `Invocation`: what a job runs (type, method, arguments), stored as JSON
//! - `JobRepository`: create/read jobs, append states, get/set parameters
//! - `JobData` / `StateData`: read views handed back to callers

pub mod repository;
pub mod types;

pub use repository::JobRepository;
pub use types::{Invocation, JobData, LoadError, NewState, StateData};
