//! Core abstractions shared by every stage of the engine.
//!
//! - [`value`]: owned SQL values and rows
//! - [`traits`]: source/destination collaborator traits
//! - [`identifier`]: identifier validation and quoting

pub mod identifier;
pub mod traits;
pub mod value;

pub use traits::{ColumnInfo, ReadOptions, SourceReader, TableReader, TableTransaction, TargetWriter};
pub use value::{Batch, Row, SqlNullType, SqlValue};
