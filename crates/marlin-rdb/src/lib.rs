//! RDB snapshot reader for MarlinDB.
//!
//! Reads the subset of the Redis RDB format needed to pre-populate the
//! keyspace at startup: string key-value pairs with optional expiry, across
//! multiple logical databases. The whole file is read into memory, the
//! CRC-64 trailer is verified, and records are parsed from the buffer.

pub mod crc64;
pub mod lzf;
pub mod reader;

pub use reader::{read_snapshot_file, Snapshot, SnapshotRecord};
