//! Database driver implementations.
//!
//! Each driver implements the collaborator traits from [`crate::core::traits`]:
//!
//! - [`postgres`]: PostgreSQL, used for both the legacy and the new schema
//! - [`memory`]: in-process tables for tests and local rehearsals
//!
//! # Adding New Databases
//!
//! 1. Create a new module under `drivers/`
//! 2. Implement `TableReader`, then `SourceReader` and/or `TargetWriter`
//! 3. Return a `TableTransaction` from `TargetWriter::begin` that discards
//!    its work when dropped without `commit`

pub mod memory;
pub mod postgres;

pub use memory::MemoryDatabase;
pub use postgres::{PostgresDatabase, PostgresTransaction, SslMode, TlsBuilder};
