//! Secure deletion for mounted FAT32 volumes.
//!
//! A normal unlink only marks the directory entry deleted and returns the
//! clusters to the free list; the data stays on disk. This crate operates
//! on the block device under the volume instead: it overwrites the
//! target's data clusters with zeros, clears its FAT chain in every FAT
//! copy, and then tombstones the directory record, long-filename slots
//! included. That order means an interruption never leaves reusable
//! clusters that still hold the data.

pub mod delete;
pub mod device;
pub mod dir;
pub mod error;
pub mod fat;
pub mod os;
pub mod volume;

pub use delete::SecureDelete;
pub use error::{FatwipeError, Result};
