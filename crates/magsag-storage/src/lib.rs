//! Storage backend for the MAGSAG runtime.
//!
//! A single logical store holding runs, their append-only event streams,
//! approval tickets, and run snapshots, exposed behind the async
//! [`StorageBackend`] trait. The shipped implementation is a WAL-mode SQLite
//! file with optional FTS5 search over event messages.

mod backend;
mod error;
mod sqlite;

pub use backend::{RunListFilter, StorageBackend, TicketListFilter, UpdateRun, VacuumReport};
pub use error::StorageError;
pub use sqlite::SqliteStorageBackend;
