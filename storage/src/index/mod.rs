//! An append-only index of needle locators for fast superblock recovery.
//!
//! Rather than rescanning the (much larger) superblock after a restart, the location of every
//! stored needle is also appended to a small index file. Replaying that file rebuilds the
//! in-memory key to location table.
//!
//! # Format
//!
//! The index file is a contiguous sequence of 16-byte [Locator] records, in insertion order:
//!
//! ```text
//! +-----------+-----------+-----------+-----+-------------+
//! | Locator_0 | Locator_1 | Locator_2 | ... | Locator_n-1 |
//! +-----------+-----------+-----------+-----+-------------+
//!
//! Locator = key (i64) | offset (u32) | size (i32), big-endian
//! ```
//!
//! There is no header, record count, or checksum. The number of records is the file length
//! divided by 16; a shorter trailing fragment is what an interrupted append leaves behind. Later
//! records for the same key supersede earlier ones, which is left to whoever consumes the replay.
//!
//! # Inserts
//!
//! [Index::insert] is synchronous, allocation-free, and never touches the disk: it fills a slot of
//! a fixed-capacity [handoff](crate::handoff) buffer. A background drain loop (one per open
//! index) moves committed slots into a write buffer and flushes it to the file. The loop is woken
//! when more than half the buffer is occupied, when the wake interval has passed since the last
//! wake, or when the loop itself has been idle for the wake interval.
//!
//! Only one caller may insert at a time, which `&mut self` enforces. Callers inserting from
//! several tasks must serialize access themselves (e.g. with a mutex around the [Index]).
//!
//! # Faults
//!
//! I/O faults (and a full handoff buffer) are sticky: the first one is recorded and every
//! subsequent mutating call fails with it without attempting any I/O. Faults hit by the drain
//! loop wedge it: the loop exits, leaves the file open, and the fault can be observed with
//! [Index::fault]. Once a fault is recorded, closing the index skips the final drain, so locators
//! still in the handoff buffer are lost. A record with an out-of-bounds size found during [scan]
//! (or an error returned by the replay callback) fails only that call and leaves the append
//! cursor where it was.
//!
//! # Durability
//!
//! [Index::flush] hands buffered records to the operating system. [Index::sync] additionally
//! drains the handoff buffer through the drain loop and syncs the file. [Index::close] returns
//! immediately; the drain loop then performs a final drain, flush and sync before closing the
//! file. Await the returned [Closed] to know when that has happened.
//!
//! # Recovery
//!
//! [Index::recover] replays every valid record from the start of the file and moves the append
//! cursor to the end of the last one, so a partial trailing record is overwritten by the next
//! append instead of being preserved.
//!
//! # Example
//!
//! ```
//! use haystack_storage::index::{Config, Index};
//! use std::num::NonZeroUsize;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let path = std::env::temp_dir().join(format!("index_doc_{}", std::process::id()));
//! let cfg = Config::new(path.clone(), NonZeroUsize::new(1024).unwrap(), 1024 * 1024);
//!
//! // Open the index and replay anything already stored
//! let mut index = Index::init(cfg).await.unwrap();
//! index.recover(|locator| { println!("{locator}"); Ok(()) }).await.unwrap();
//!
//! // Queue a locator and persist it
//! index.insert(1, 0, 100).unwrap();
//! index.sync().await.unwrap();
//!
//! // Shut down and wait for the file to be closed
//! index.close().unwrap().await.unwrap();
//! # std::fs::remove_file(path).unwrap();
//! # }
//! ```

mod disk;
mod drain;
mod fault;
mod metrics;
mod preallocate;
mod scan;

pub use crate::locator::Locator;
pub use disk::{Closed, Index};
pub use scan::scan;

use std::{num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;

/// Default amount of disk reserved for a newly created index file (100 MiB).
pub const DEFAULT_PREALLOCATE: u64 = 100 * 1024 * 1024;

/// Default time after which buffered locators are drained even if few are pending.
pub const DEFAULT_WAKE_INTERVAL: Duration = Duration::from_secs(30);

/// Errors that can occur when interacting with the index.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("handoff buffer full")]
    BufferFull,
    #[error("invalid record size {size} at offset {offset}")]
    InvalidSize { offset: u64, size: i32 },
    #[error("record rejected: {0}")]
    Rejected(String),
    #[error("index closed")]
    Closed,
    #[error("index already open")]
    AlreadyOpen,
    #[error("drain loop failed")]
    DrainFailed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Configuration for [Index] storage.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the index file. It is created if missing.
    pub path: PathBuf,

    /// Number of locators the handoff buffer can hold before inserts fail.
    pub capacity: NonZeroUsize,

    /// Largest needle size a record may carry. Records outside `[1, max_record_size]` are
    /// rejected during replay.
    ///
    /// Also used as the size of the write buffer and of the replay read buffer (capped at 1 MiB).
    pub max_record_size: u32,

    /// Bytes of disk to reserve when the index file is created (`0` disables).
    pub preallocate: u64,

    /// Time after which the drain loop runs even if the handoff buffer is not half full.
    pub wake_interval: Duration,
}

impl Config {
    /// Create a configuration with the default preallocation and wake interval.
    pub fn new(path: PathBuf, capacity: NonZeroUsize, max_record_size: u32) -> Self {
        Self {
            path,
            capacity,
            max_record_size,
            preallocate: DEFAULT_PREALLOCATE,
            wake_interval: DEFAULT_WAKE_INTERVAL,
        }
    }
}
