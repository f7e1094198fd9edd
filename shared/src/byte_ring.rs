//! # Interrupt-Safe Byte Ring
//!
//! Lock-free single-producer / single-consumer byte ring that carries raw UART
//! bytes between the interrupt handler and the polling task (and, on the
//! transmit side, between the frame encoder and the hardware).
//!
//! ## Handoff Discipline
//!
//! 1. **Split Ownership**: [`ByteRing::split`] borrows the ring mutably and
//!    returns exactly one [`Producer`] and one [`Consumer`]. The interrupt owns
//!    the producer, the task owns the consumer.
//!
//! 2. **Own Cursor Only**: the producer only ever advances `write_idx`, the
//!    consumer only ever advances `read_idx`. Neither side takes a lock.
//!
//! 3. **Acquire/Release**: bytes are written before `write_idx` is published
//!    with `Release`; the consumer loads it with `Acquire` before reading.
//!    The same pairing protects freed space in the other direction.
//!
//! 4. **DMA Compatibility**: the producer can hand out the free region as two
//!    mutable slices so a peripheral writes in place, then report the count
//!    with [`Producer::commit`]. That call is the `on_bytes_available(count)`
//!    hook: constant time, no parsing.
//!
//! ## Memory Layout
//!
//! ```text
//! ┌──────────┬───────────────────────┬─────────────────────────┐
//! │   free   │    readable bytes     │          free           │
//! └──────────┴───────────────────────┴─────────────────────────┘
//!            ▲                       ▲
//!         read_idx               write_idx      (indices run free,
//!                                                masked on access)
//! ```

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Errors specific to byte ring operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferError {
    /// Attempted to write more data than available space
    Overflow,
    /// Attempted to consume more data than available
    Underflow,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::Overflow => f.write_str("byte ring overflow"),
            BufferError::Underflow => f.write_str("byte ring underflow"),
        }
    }
}

impl core::error::Error for BufferError {}

/// A read-only view into the ring, split at the wrap-around point
#[derive(Debug)]
pub struct BufferSlice<'a> {
    /// First contiguous chunk (before wrap-around)
    pub first: &'a [u8],
    /// Second contiguous chunk (after wrap-around, may be empty)
    pub second: &'a [u8],
}

impl<'a> BufferSlice<'a> {
    /// Total length across both chunks
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a u8> {
        self.first.iter().chain(self.second.iter())
    }
}

/// A writable view into the free region of the ring
#[derive(Debug)]
pub struct BufferSliceMut<'a> {
    /// First contiguous chunk (before wrap-around)
    pub first: &'a mut [u8],
    /// Second contiguous chunk (after wrap-around, may be empty)
    pub second: &'a mut [u8],
}

impl<'a> BufferSliceMut<'a> {
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut u8> {
        self.first.iter_mut().chain(self.second.iter_mut())
    }
}

/// Statically allocatable SPSC byte ring of `N` bytes.
///
/// `N` must be a power of two; this is checked at compile time.
///
/// # Example
///
/// ```rust
/// use serial_link::byte_ring::ByteRing;
///
/// let mut ring: ByteRing<64> = ByteRing::new();
/// let (mut producer, mut consumer) = ring.split();
///
/// // Interrupt side: DMA wrote 5 bytes in place, publish them
/// let region = producer.writable_split(5);
/// region.first[..5].copy_from_slice(b"hello");
/// producer.commit(5).unwrap();
///
/// // Task side
/// assert_eq!(consumer.readable_slice(5), Some(&b"hello"[..]));
/// consumer.consume(5).unwrap();
/// ```
pub struct ByteRing<const N: usize> {
    data: UnsafeCell<[u8; N]>,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
}

// SAFETY: the byte storage is only reachable through `Producer` and
// `Consumer`, and `split` hands out at most one of each per exclusive borrow.
// The producer touches only the free region, the consumer only the readable
// region, and the regions are published through acquire/release cursors.
unsafe impl<const N: usize> Sync for ByteRing<N> {}

impl<const N: usize> ByteRing<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "ByteRing size must be a power of two");
        N - 1
    };

    /// Create a new zero-initialized ring
    pub const fn new() -> Self {
        let _ = Self::MASK;
        Self {
            data: UnsafeCell::new([0u8; N]),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of bytes published but not yet consumed
    #[inline]
    pub fn readable_len(&self) -> usize {
        let write = self.write_idx.load(Ordering::Acquire);
        let read = self.read_idx.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    #[inline]
    pub fn writable_len(&self) -> usize {
        N - self.readable_len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_len() == 0
    }

    /// Split into the producer and consumer halves.
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        let ring: &Self = self;
        (Producer { ring }, Consumer { ring })
    }

    /// Reset the ring to empty state
    pub fn reset(&mut self) {
        self.read_idx.store(0, Ordering::Release);
        self.write_idx.store(0, Ordering::Release);
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.data.get().cast::<u8>()
    }
}

impl<const N: usize> Default for ByteRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writing half of a [`ByteRing`], owned by the interrupt (rx) or the
/// encoder (tx).
pub struct Producer<'a, const N: usize> {
    ring: &'a ByteRing<N>,
}

impl<'a, const N: usize> Producer<'a, N> {
    #[inline]
    pub fn writable_len(&self) -> usize {
        self.ring.writable_len()
    }

    /// Borrow up to `max_len` bytes of free space for in-place writes.
    ///
    /// Nothing becomes visible to the consumer until [`commit`](Self::commit).
    pub fn writable_split(&mut self, max_len: usize) -> BufferSliceMut<'_> {
        let len = max_len.min(self.ring.writable_len());
        let start = self.ring.write_idx.load(Ordering::Relaxed) & ByteRing::<N>::MASK;
        let first_len = len.min(N - start);

        // SAFETY: [start, start + len) modulo N lies in the free region, which
        // the consumer never reads until `commit` publishes it. The two
        // slices are disjoint because len <= N.
        unsafe {
            let base = self.ring.base();
            BufferSliceMut {
                first: core::slice::from_raw_parts_mut(base.add(start), first_len),
                second: core::slice::from_raw_parts_mut(base, len - first_len),
            }
        }
    }

    /// Publish `len` freshly written bytes to the consumer
    pub fn commit(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.ring.writable_len() {
            return Err(BufferError::Overflow);
        }
        let write = self.ring.write_idx.load(Ordering::Relaxed);
        self.ring
            .write_idx
            .store(write.wrapping_add(len), Ordering::Release);
        Ok(())
    }

    /// Copy `data` into the ring, all or nothing
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        if data.len() > self.ring.writable_len() {
            return Err(BufferError::Overflow);
        }

        let region = self.writable_split(data.len());
        let (head, tail) = data.split_at(region.first.len());
        region.first.copy_from_slice(head);
        region.second.copy_from_slice(tail);

        self.commit(data.len())?;
        Ok(data.len())
    }

    pub fn push(&mut self, byte: u8) -> Result<(), BufferError> {
        self.write(&[byte]).map(|_| ())
    }
}

/// Reading half of a [`ByteRing`], owned by the polling task (rx) or the
/// transmit path (tx).
pub struct Consumer<'a, const N: usize> {
    ring: &'a ByteRing<N>,
}

impl<'a, const N: usize> Consumer<'a, N> {
    #[inline]
    pub fn readable_len(&self) -> usize {
        self.ring.readable_len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Get the first contiguous readable chunk of up to `max_len` bytes.
    ///
    /// Returns `None` when the ring is empty. Data past the wrap-around point
    /// is returned by the next call, after [`consume`](Self::consume).
    pub fn readable_slice(&self, max_len: usize) -> Option<&[u8]> {
        let view = self.readable_split(max_len);
        if view.is_empty() {
            None
        } else {
            Some(view.first)
        }
    }

    /// Get a split readable view covering up to `max_len` bytes
    pub fn readable_split(&self, max_len: usize) -> BufferSlice<'_> {
        let len = max_len.min(self.ring.readable_len());
        let start = self.ring.read_idx.load(Ordering::Relaxed) & ByteRing::<N>::MASK;
        let first_len = len.min(N - start);

        // SAFETY: [start, start + len) modulo N was published by the producer
        // with Release and observed above with Acquire; the producer does not
        // write there again until `consume` releases it.
        unsafe {
            let base = self.ring.base();
            BufferSlice {
                first: core::slice::from_raw_parts(base.add(start), first_len),
                second: core::slice::from_raw_parts(base, len - first_len),
            }
        }
    }

    /// Release `len` bytes back to the producer
    pub fn consume(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.ring.readable_len() {
            return Err(BufferError::Underflow);
        }
        let read = self.ring.read_idx.load(Ordering::Relaxed);
        self.ring
            .read_idx
            .store(read.wrapping_add(len), Ordering::Release);
        Ok(())
    }

    /// Copy out as many bytes as fit in `buf`
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = {
            let view = self.readable_split(buf.len());
            let len = view.len();
            let (head, tail) = buf[..len].split_at_mut(view.first.len());
            head.copy_from_slice(view.first);
            tail.copy_from_slice(view.second);
            len
        };
        // Cannot underflow: len was bounded by readable_len above.
        let _ = self.consume(len);
        len
    }

    pub fn pop(&mut self) -> Option<u8> {
        let byte = *self.readable_slice(1)?.first()?;
        let _ = self.consume(1);
        Some(byte)
    }
}
