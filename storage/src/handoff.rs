//! Fixed-capacity single-producer/single-consumer slot ring.
//!
//! The ring decouples a synchronous producer from a consumer running on another task. Both ends
//! work in two phases: `reserve_*` exposes the next slot in place without moving any cursor and
//! `commit_*` advances the cursor by one, publishing (or freeing) that slot for the other end.
//! Slots are allocated once, at construction, and reused for the lifetime of the ring.
//!
//! Cursors are monotonic and taken modulo the capacity, so occupancy is always
//! `write - read` and lies within `[0, capacity]`.
//!
//! # Example
//!
//! ```
//! use haystack_storage::handoff::{channel, Error};
//! use std::num::NonZeroUsize;
//!
//! let (mut producer, mut consumer) = channel::<u64>(NonZeroUsize::new(2).unwrap());
//!
//! *producer.reserve_write().unwrap() = 7;
//! producer.commit_write();
//!
//! assert_eq!(*consumer.reserve_read().unwrap(), 7);
//! consumer.commit_read();
//! assert_eq!(consumer.reserve_read(), Err(Error::Empty));
//! ```

use std::{
    cell::UnsafeCell,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Errors that can occur when reserving a slot.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every slot holds a committed value that has not been consumed yet.
    #[error("handoff full")]
    Full,
    /// No committed value is waiting to be consumed.
    #[error("handoff empty")]
    Empty,
}

/// Cursor padded to its own cache line(s) so the producer and consumer don't false-share.
#[repr(align(128))]
struct Cursor(AtomicU64);

struct Ring<T> {
    slots: Box<[UnsafeCell<T>]>,
    write: Cursor,
    read: Cursor,
}

// Each slot is only ever accessed by the end that currently owns it (the producer between its
// reservation and commit, the consumer likewise), and ownership is transferred through the
// release/acquire pairs on the cursors.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn slot(&self, cursor: u64) -> *mut T {
        self.slots[(cursor % self.capacity()) as usize].get()
    }
}

/// Create a ring with `capacity` slots and return its two ends.
pub fn channel<T: Default + Send>(capacity: NonZeroUsize) -> (Producer<T>, Consumer<T>) {
    let slots = (0..capacity.get())
        .map(|_| UnsafeCell::new(T::default()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        slots,
        write: Cursor(AtomicU64::new(0)),
        read: Cursor(AtomicU64::new(0)),
    });
    (
        Producer {
            ring: ring.clone(),
            write: 0,
            reserved: false,
        },
        Consumer {
            ring,
            read: 0,
            reserved: false,
        },
    )
}

/// Writing end of the ring.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
    write: u64,
    reserved: bool,
}

impl<T> Producer<T> {
    /// Claim the next free slot for writing without publishing it.
    ///
    /// The slot still holds whatever value was last stored in it; the caller is expected to
    /// overwrite every field before calling [Producer::commit_write].
    pub fn reserve_write(&mut self) -> Result<&mut T, Error> {
        let read = self.ring.read.0.load(Ordering::Acquire);
        if self.write - read == self.ring.capacity() {
            return Err(Error::Full);
        }
        self.reserved = true;

        // SAFETY: the consumer has released this slot (observed through the acquire above) and
        // cannot observe it again until `commit_write` advances the write cursor.
        Ok(unsafe { &mut *self.ring.slot(self.write) })
    }

    /// Publish the slot returned by the last successful [Producer::reserve_write].
    ///
    /// # Panics
    ///
    /// Panics if no slot is reserved.
    pub fn commit_write(&mut self) {
        assert!(self.reserved, "commit_write without reserve_write");
        self.reserved = false;
        self.write += 1;
        self.ring.write.0.store(self.write, Ordering::Release);
    }

    /// Number of committed slots not yet consumed.
    pub fn occupancy(&self) -> usize {
        (self.write - self.ring.read.0.load(Ordering::Acquire)) as usize
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.ring.slots.len()
    }
}

/// Reading end of the ring.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
    read: u64,
    reserved: bool,
}

impl<T> Consumer<T> {
    /// Claim the oldest committed slot for reading without freeing it.
    ///
    /// [Error::Empty] is the ordinary "nothing left" signal and not a fault.
    pub fn reserve_read(&mut self) -> Result<&T, Error> {
        let write = self.ring.write.0.load(Ordering::Acquire);
        if write == self.read {
            return Err(Error::Empty);
        }
        self.reserved = true;

        // SAFETY: the producer published this slot (observed through the acquire above) and
        // cannot reserve it again until `commit_read` advances the read cursor.
        Ok(unsafe { &*self.ring.slot(self.read) })
    }

    /// Free the slot returned by the last successful [Consumer::reserve_read].
    ///
    /// # Panics
    ///
    /// Panics if no slot is reserved.
    pub fn commit_read(&mut self) {
        assert!(self.reserved, "commit_read without reserve_read");
        self.reserved = false;
        self.read += 1;
        self.ring.read.0.store(self.read, Ordering::Release);
    }

    /// Number of committed slots not yet consumed.
    pub fn occupancy(&self) -> usize {
        (self.ring.write.0.load(Ordering::Acquire) - self.read) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_reserve_does_not_publish() {
        let (mut producer, mut consumer) = channel::<u32>(nz(4));

        *producer.reserve_write().unwrap() = 1;
        assert_eq!(producer.occupancy(), 0);
        assert_eq!(consumer.reserve_read(), Err(Error::Empty));

        producer.commit_write();
        assert_eq!(producer.occupancy(), 1);
        assert_eq!(consumer.occupancy(), 1);

        // Reading twice without committing returns the same slot
        assert_eq!(*consumer.reserve_read().unwrap(), 1);
        assert_eq!(*consumer.reserve_read().unwrap(), 1);
        assert_eq!(consumer.occupancy(), 1);

        consumer.commit_read();
        assert_eq!(consumer.occupancy(), 0);
        assert_eq!(producer.occupancy(), 0);
    }

    #[test]
    fn test_full_and_empty() {
        let (mut producer, mut consumer) = channel::<u32>(nz(3));
        assert_eq!(producer.capacity(), 3);

        for i in 0..3 {
            *producer.reserve_write().unwrap() = i;
            producer.commit_write();
        }
        assert_eq!(producer.reserve_write(), Err(Error::Full));
        assert_eq!(producer.occupancy(), 3);

        // Freeing one slot makes room for exactly one more
        assert_eq!(*consumer.reserve_read().unwrap(), 0);
        consumer.commit_read();
        *producer.reserve_write().unwrap() = 3;
        producer.commit_write();
        assert_eq!(producer.reserve_write(), Err(Error::Full));

        for expected in 1..4 {
            assert_eq!(*consumer.reserve_read().unwrap(), expected);
            consumer.commit_read();
        }
        assert_eq!(consumer.reserve_read(), Err(Error::Empty));
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut producer, mut consumer) = channel::<u64>(nz(5));
        let mut expected = 0;
        for round in 0..100u64 {
            // Vary the batch size so the cursors land on every slot index
            let batch = round % 5 + 1;
            for i in 0..batch {
                *producer.reserve_write().unwrap() = round * 10 + i;
                producer.commit_write();
            }
            for i in 0..batch {
                expected = round * 10 + i;
                assert_eq!(*consumer.reserve_read().unwrap(), expected);
                consumer.commit_read();
            }
        }
        assert_eq!(expected, 99 * 10 + 99 % 5);
        assert_eq!(consumer.occupancy(), 0);
    }

    #[test]
    #[should_panic(expected = "commit_write without reserve_write")]
    fn test_commit_write_without_reserve() {
        let (mut producer, _consumer) = channel::<u32>(nz(1));
        producer.commit_write();
    }

    #[test]
    #[should_panic(expected = "commit_read without reserve_read")]
    fn test_commit_read_without_reserve() {
        let (_producer, mut consumer) = channel::<u32>(nz(1));
        consumer.commit_read();
    }

    #[test]
    fn test_concurrent_spsc() {
        const COUNT: u64 = 100_000;
        let (mut producer, mut consumer) = channel::<(u64, u64)>(nz(64));

        let writer = thread::spawn(move || {
            let mut next = 0;
            while next < COUNT {
                match producer.reserve_write() {
                    Ok(slot) => {
                        *slot = (next, next.wrapping_mul(31));
                        producer.commit_write();
                        next += 1;
                    }
                    Err(Error::Full) => thread::yield_now(),
                    Err(Error::Empty) => unreachable!(),
                }
            }
        });

        let mut next = 0;
        while next < COUNT {
            match consumer.reserve_read() {
                Ok(&(seq, check)) => {
                    assert_eq!(seq, next);
                    assert_eq!(check, next.wrapping_mul(31));
                    consumer.commit_read();
                    next += 1;
                }
                Err(Error::Empty) => thread::yield_now(),
                Err(Error::Full) => unreachable!(),
            }
        }
        writer.join().unwrap();
        assert_eq!(consumer.reserve_read(), Err(Error::Empty));
    }
}
