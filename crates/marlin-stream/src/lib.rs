//! Ordered stream index for MarlinDB.
//!
//! This crate provides:
//! - Entry-id parsing and the fixed-width base-64 internal key encoding
//! - A bitmap radix trie (Array Mapped Tree with single-child compression)
//!   whose sibling order equals entry-id order
//! - The stream object: append discipline, range scans, and live
//!   subscriptions with blocking waits

pub mod keys;
mod node;
pub mod stream;

pub use keys::{parse_entry_id, EntryId, InternalId, INTERNAL_LEN};
pub use node::Entry;
pub use stream::{Delivery, Stream};
