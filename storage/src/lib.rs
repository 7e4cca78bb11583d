//! Persist and recover the location of every needle stored in a superblock.
//!
//! A Haystack-style store keeps needles (blobs) in one large append-only superblock. To avoid
//! rescanning the superblock after a restart, each needle's [Locator] (key, offset, size) is
//! also appended to a compact [index](index::Index) file that can be replayed quickly.
//!
//! # Status
//!
//! `haystack-storage` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

pub mod handoff;
pub mod index;
pub mod locator;

pub use index::{Config, Error, Index};
pub use locator::Locator;
