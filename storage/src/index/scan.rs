use super::Error;
use crate::locator::Locator;
use bytes::{Buf, BytesMut};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Largest amount of data a [Reader] pulls from its source at once (1 MiB).
const MAX_READ_CHUNK: usize = 1024 * 1024;

/// Buffered reader that can inspect upcoming bytes without consuming them.
///
/// Unlike [tokio::io::BufReader], a peek is satisfied across buffer boundaries: it keeps reading
/// until either enough bytes are buffered or the underlying reader is exhausted.
pub(super) struct Reader<R> {
    inner: R,
    buffer: BytesMut,
    chunk: usize,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    /// Create a reader that pulls up to `chunk` bytes (at most [MAX_READ_CHUNK]) from `inner` at
    /// a time.
    pub fn new(inner: R, chunk: usize) -> Self {
        let chunk = chunk.clamp(Locator::SIZE, MAX_READ_CHUNK);
        Self {
            inner,
            buffer: BytesMut::with_capacity(chunk),
            chunk,
            exhausted: false,
        }
    }

    /// Return the next `n` bytes without advancing, or `None` if fewer than `n` remain.
    pub async fn peek(&mut self, n: usize) -> Result<Option<&[u8]>, std::io::Error> {
        while self.buffer.len() < n && !self.exhausted {
            if self.buffer.capacity() - self.buffer.len() < n {
                self.buffer.reserve(self.chunk);
            }
            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                self.exhausted = true;
            }
        }
        if self.buffer.len() < n {
            return Ok(None);
        }
        Ok(Some(&self.buffer[..n]))
    }

    /// Skip `n` bytes previously returned by [Reader::peek].
    pub fn advance(&mut self, n: usize) {
        self.buffer.advance(n);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Replay every valid [Locator] stored in `reader`, starting at offset 0, into `callback`.
///
/// Scanning stops cleanly when fewer than [Locator::SIZE] bytes remain (including a partial
/// trailing record left behind by an interrupted append). A record whose size is outside
/// `[1, max_record_size]` stops the scan with [Error::InvalidSize] before `callback` sees it. An
/// error returned by `callback` stops the scan and is returned as is.
///
/// Returns the number of bytes covered by the records handed to `callback`.
pub async fn scan<R, F>(mut reader: R, max_record_size: u32, mut callback: F) -> Result<u64, Error>
where
    R: AsyncRead + AsyncSeek + Unpin,
    F: FnMut(Locator) -> Result<(), Error>,
{
    info!("scanning index");
    reader.seek(SeekFrom::Start(0)).await?;
    let mut reader = Reader::new(reader, max_record_size as usize);
    let mut offset = 0u64;
    loop {
        let mut raw = [0u8; Locator::SIZE];
        match reader.peek(Locator::SIZE).await? {
            Some(peeked) => raw.copy_from_slice(peeked),
            None => break,
        }
        let locator = Locator::decode(&raw);
        if !locator.is_valid(max_record_size) {
            warn!(offset, size = locator.size, "invalid record size, stopping scan");
            return Err(Error::InvalidSize {
                offset,
                size: locator.size,
            });
        }
        reader.advance(Locator::SIZE);
        debug!(offset, %locator, "scanned record");
        offset += Locator::SIZE_U64;
        callback(locator)?;
    }

    let trailing = reader.buffered();
    if trailing > 0 {
        warn!(offset, trailing, "partial trailing record ignored");
    }
    info!(records = offset / Locator::SIZE_U64, "scanned index");
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_case::test_case;

    const MAX_RECORD_SIZE: u32 = 1024 * 1024;

    fn encode(locators: &[Locator]) -> Vec<u8> {
        locators.iter().flat_map(|l| l.to_bytes()).collect()
    }

    #[tokio::test]
    async fn test_peek_across_chunks() {
        let data: Vec<u8> = (0..40u8).collect();
        // A chunk smaller than a record still yields full peeks
        let mut reader = Reader::new(Cursor::new(data), 1);
        assert_eq!(reader.peek(16).await.unwrap().unwrap(), &(0..16).collect::<Vec<u8>>()[..]);
        // Peeking again does not consume
        assert_eq!(reader.peek(16).await.unwrap().unwrap()[0], 0);
        reader.advance(16);
        assert_eq!(reader.peek(16).await.unwrap().unwrap()[0], 16);
        reader.advance(16);
        assert!(reader.peek(16).await.unwrap().is_none());
        assert_eq!(reader.buffered(), 8);
        assert_eq!(reader.peek(8).await.unwrap().unwrap()[0], 32);
    }

    #[test]
    fn test_reader_chunk_is_bounded() {
        let reader = Reader::new(Cursor::new(Vec::<u8>::new()), usize::MAX);
        assert_eq!(reader.chunk, MAX_READ_CHUNK);
        assert!(reader.buffer.capacity() < 2 * MAX_READ_CHUNK);

        let reader = Reader::new(Cursor::new(Vec::<u8>::new()), 0);
        assert_eq!(reader.chunk, Locator::SIZE);
    }

    #[tokio::test]
    async fn test_scan_unbounded_record_size() {
        let locators = vec![Locator::new(1, 0, i32::MAX), Locator::new(2, 16, 1)];
        let mut seen = Vec::new();
        let consumed = scan(Cursor::new(encode(&locators)), u32::MAX, |l| {
            seen.push(l);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(consumed, 32);
        assert_eq!(seen, locators);
    }

    #[tokio::test]
    async fn test_scan_in_order() {
        let locators = vec![
            Locator::new(1, 0, 100),
            Locator::new(2, 128, 200),
            Locator::new(-3, u32::MAX, MAX_RECORD_SIZE as i32),
        ];
        let mut seen = Vec::new();
        let consumed = scan(Cursor::new(encode(&locators)), MAX_RECORD_SIZE, |l| {
            seen.push(l);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(consumed, 48);
        assert_eq!(seen, locators);
    }

    #[tokio::test]
    async fn test_scan_starts_at_zero() {
        let locators = vec![Locator::new(1, 0, 1), Locator::new(2, 1, 2)];
        let mut cursor = Cursor::new(encode(&locators));
        cursor.set_position(20);
        let mut seen = Vec::new();
        scan(&mut cursor, MAX_RECORD_SIZE, |l| {
            seen.push(l);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen, locators);
    }

    #[tokio::test]
    async fn test_scan_empty() {
        let mut calls = 0;
        let consumed = scan(Cursor::new(Vec::new()), MAX_RECORD_SIZE, |_| {
            calls += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(calls, 0);
    }

    #[test_case(1; "one byte")]
    #[test_case(8; "half record")]
    #[test_case(15; "all but one byte")]
    #[tokio::test]
    async fn test_scan_ignores_partial_tail(tail: usize) {
        let locators = vec![Locator::new(1, 0, 10), Locator::new(2, 1, 20)];
        let mut data = encode(&locators);
        data.extend(std::iter::repeat(0xFF).take(tail));
        let mut seen = Vec::new();
        let consumed = scan(Cursor::new(data), MAX_RECORD_SIZE, |l| {
            seen.push(l);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(consumed, 32);
        assert_eq!(seen, locators);
    }

    #[test_case(0; "zero")]
    #[test_case(-1; "negative")]
    #[test_case(MAX_RECORD_SIZE as i32 + 1; "above max")]
    #[test_case(i32::MIN; "minimum")]
    #[tokio::test]
    async fn test_scan_rejects_size(bad: i32) {
        let data = encode(&[Locator::new(1, 0, 10), Locator::new(2, 16, bad)]);
        let mut seen = Vec::new();
        let err = scan(Cursor::new(data), MAX_RECORD_SIZE, |l| {
            seen.push(l);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSize { offset: 16, size } if size == bad));
        assert_eq!(seen, vec![Locator::new(1, 0, 10)]);
    }

    #[tokio::test]
    async fn test_scan_callback_error() {
        let data = encode(&[
            Locator::new(1, 0, 10),
            Locator::new(2, 1, 20),
            Locator::new(3, 2, 30),
        ]);
        let mut calls = 0;
        let err = scan(Cursor::new(data), MAX_RECORD_SIZE, |l| {
            calls += 1;
            if l.key == 2 {
                return Err(Error::Rejected("duplicate".into()));
            }
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Rejected(msg) if msg == "duplicate"));
        assert_eq!(calls, 2);
    }
}
