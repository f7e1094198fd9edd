//! # Circular Buffer
//!
//! Fixed-capacity FIFO used for every packet queue in the link: completed
//! frames, per-sub-type receive queues, the outbound queue and link events.
//!
//! Storage is allocated once at construction and never resized. Each slot is
//! an `Option<T>`, so ownership of a queued value moves in on `write` and out
//! on `read`; nothing is ever aliased between the queue and its consumer.
//!
//! ## Overwrite Policy
//!
//! ```text
//!  capacity = 4, full                 write(E)
//! ┌───┬───┬───┬───┐               ┌───┬───┬───┬───┐
//! │ A │ B │ C │ D │      ──►      │ E │ B │ C │ D │   A is returned
//! └───┴───┴───┴───┘               └───┴───┴───┴───┘
//!   ▲ read/write                        ▲ read = B
//! ```
//!
//! Writing into a full buffer evicts the oldest unread element and hands it
//! back to the caller. Producers size the capacity for their worst-case burst
//! and count evictions; a queue that must reject new elements instead checks
//! [`CircularBuffer::is_full`] before writing.

use alloc::boxed::Box;
use alloc::vec::Vec;

/// Fixed-capacity ring of `T` with overwrite-oldest semantics.
///
/// No locking is implied. Every instance is owned by exactly one component;
/// the only structure crossing execution contexts is the byte ring in
/// [`crate::byte_ring`].
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    slots: Box<[Option<T>]>,
    read_idx: usize,
    write_idx: usize,
    unread: usize,
}

impl<T> CircularBuffer<T> {
    /// Allocate a buffer with `capacity` slots.
    ///
    /// A capacity of zero is bumped to one; an empty ring is not a valid state.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice(),
            read_idx: 0,
            write_idx: 0,
            unread: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of elements written but not yet read
    #[inline]
    pub fn unread(&self) -> usize {
        self.unread
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.unread == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.unread == self.capacity()
    }

    #[inline]
    fn advance(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next >= self.slots.len() {
            0
        } else {
            next
        }
    }

    /// Drop the oldest element if the buffer is full, returning it.
    fn make_room(&mut self) -> Option<T> {
        if !self.is_full() {
            return None;
        }
        let evicted = self.slots[self.read_idx].take();
        self.read_idx = self.advance(self.read_idx);
        self.unread -= 1;
        evicted
    }

    /// Append `value`, always succeeding.
    ///
    /// Returns the evicted oldest element when the buffer was full.
    pub fn write(&mut self, value: T) -> Option<T> {
        let evicted = self.make_room();
        self.slots[self.write_idx] = Some(value);
        self.write_idx = self.advance(self.write_idx);
        self.unread += 1;
        evicted
    }

    /// Claim the next slot for in-place construction.
    ///
    /// The slot is reset to `T::default()` and counts as unread immediately.
    /// Follows the same overwrite policy as [`write`](Self::write).
    pub fn write_slot(&mut self) -> &mut T
    where
        T: Default,
    {
        let _ = self.make_room();
        let idx = self.write_idx;
        self.write_idx = self.advance(idx);
        self.unread += 1;
        self.slots[idx].insert(T::default())
    }

    /// Take the oldest unread element
    pub fn read(&mut self) -> Option<T> {
        if self.unread == 0 {
            return None;
        }
        let value = self.slots[self.read_idx].take();
        self.read_idx = self.advance(self.read_idx);
        self.unread -= 1;
        value
    }

    /// Borrow the oldest unread element without consuming it
    pub fn peek(&self) -> Option<&T> {
        if self.unread == 0 {
            return None;
        }
        self.slots[self.read_idx].as_ref()
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        if self.unread == 0 {
            return None;
        }
        self.slots[self.read_idx].as_mut()
    }

    /// Iterate unread elements from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.capacity();
        (0..self.unread).filter_map(move |i| self.slots[(self.read_idx + i) % capacity].as_ref())
    }

    /// Drop every unread element and rewind the cursors
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.read_idx = 0;
        self.write_idx = 0;
        self.unread = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let ring: CircularBuffer<u8> = CircularBuffer::new(4);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.capacity(), 4);
        assert!(ring.peek().is_none());
    }

    #[test]
    fn test_zero_capacity_becomes_one() {
        let mut ring = CircularBuffer::new(0);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.write(7u8), None);
        assert_eq!(ring.write(8u8), Some(7));
        assert_eq!(ring.read(), Some(8));
    }

    #[test]
    fn test_fifo_order_with_wrap_around() {
        let mut ring = CircularBuffer::new(3);
        for round in 0..5u32 {
            ring.write(round * 10);
            ring.write(round * 10 + 1);
            assert_eq!(ring.read(), Some(round * 10));
            assert_eq!(ring.read(), Some(round * 10 + 1));
        }
        assert!(ring.read().is_none());
    }

    #[test]
    fn test_full_write_overwrites_oldest() {
        let mut ring = CircularBuffer::new(3);
        assert_eq!(ring.write('a'), None);
        assert_eq!(ring.write('b'), None);
        assert_eq!(ring.write('c'), None);
        assert!(ring.is_full());

        assert_eq!(ring.write('d'), Some('a'));
        assert_eq!(ring.unread(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec!['b', 'c', 'd']);
    }

    #[test]
    fn test_unread_never_exceeds_capacity() {
        let mut ring = CircularBuffer::new(5);
        for i in 0..100 {
            ring.write(i);
            assert!(ring.unread() <= ring.capacity());
        }
        assert_eq!(ring.read(), Some(95));
    }

    #[test]
    fn test_write_slot_constructs_in_place() {
        let mut ring: CircularBuffer<Vec<u8>> = CircularBuffer::new(2);
        ring.write_slot().extend_from_slice(b"hi");
        ring.write(b"yo".to_vec());
        ring.write_slot().push(1);

        assert_eq!(ring.unread(), 2);
        assert_eq!(ring.read().as_deref(), Some(&b"yo"[..]));
        assert_eq!(ring.read().as_deref(), Some(&[1u8][..]));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut ring = CircularBuffer::new(2);
        ring.write(1);
        assert_eq!(ring.peek(), Some(&1));
        *ring.peek_mut().unwrap() = 5;
        assert_eq!(ring.unread(), 1);
        assert_eq!(ring.read(), Some(5));
    }

    #[test]
    fn test_clear() {
        let mut ring = CircularBuffer::new(2);
        ring.write(1);
        ring.write(2);
        ring.clear();
        assert!(ring.is_empty());
        ring.write(3);
        assert_eq!(ring.read(), Some(3));
    }
}
