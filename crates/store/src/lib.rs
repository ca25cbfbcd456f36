//! Transactional record store boundary.
//!
//! The storage engine is written against [`RecordStore`]: atomic
//! read-modify-write transactions over a typed state made of [`Table`]s with
//! primary-key lookup and ordered range scans. Two backends are provided:
//!
//! - [`InMemoryStore`]: process-local, for tests/dev and embedded use
//! - [`FileStore`]: the in-memory store plus a JSON snapshot written after
//!   every committed transaction; one owner per snapshot path at a time

pub mod error;
pub mod file;
pub mod memory;
pub mod table;
pub mod r#trait;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use table::{Record, Table};
pub use r#trait::RecordStore;
