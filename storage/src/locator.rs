//! Fixed-width binary codec for a single needle locator.
//!
//! A [Locator] is always persisted as 16 big-endian bytes:
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |12 |13 |14 |15 |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! |          Key (i64)            |  Offset (u32) |   Size (i32)  |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+
//! ```
//!
//! There is no padding, length prefix, or checksum. Decoding never validates; callers decide
//! whether a decoded [Locator] is acceptable with [Locator::is_valid].

use bytes::{Buf, BufMut};
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Size of the key field.
const KEY_SIZE: usize = 8;

/// Size of the offset field.
const OFFSET_SIZE: usize = 4;

/// Size of the size field.
const SIZE_SIZE: usize = 4;

/// Location of a needle inside the superblock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Locator {
    /// Needle key (photo id).
    pub key: i64,
    /// Needle offset in the superblock, in caller-defined alignment units.
    pub offset: u32,
    /// Needle data size.
    pub size: i32,
}

impl Locator {
    /// Encoded width of a [Locator].
    pub const SIZE: usize = KEY_SIZE + OFFSET_SIZE + SIZE_SIZE;

    /// Encoded width of a [Locator] as a `u64`.
    pub const SIZE_U64: u64 = Self::SIZE as u64;

    /// Create a new [Locator].
    pub const fn new(key: i64, offset: u32, size: i32) -> Self {
        Self { key, offset, size }
    }

    /// Decode a [Locator] from its fixed-width representation.
    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        let key = buf.get_i64();
        let offset = buf.get_u32();
        let size = buf.get_i32();
        Self { key, offset, size }
    }

    /// Return the fixed-width representation of the [Locator].
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_i64(self.key);
        buf.put_u32(self.offset);
        buf.put_i32(self.size);
        out
    }

    /// Write the [Locator] to `sink`, one field at a time.
    ///
    /// The first failing field aborts the write and its error is returned as is. Fields after
    /// it are never attempted.
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, sink: &mut W) -> std::io::Result<()> {
        sink.write_i64(self.key).await?;
        sink.write_u32(self.offset).await?;
        sink.write_i32(self.size).await
    }

    /// Returns true if `size` is within `[1, max_record_size]`.
    pub fn is_valid(&self, max_record_size: u32) -> bool {
        self.size >= 1 && i64::from(self.size) <= i64::from(max_record_size)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key={} offset={} size={}",
            self.key, self.offset, self.size
        )
    }
}
