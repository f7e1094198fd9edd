//! # Packet Buffer
//!
//! Growable byte array addressed by `(offset, width)` pairs, at either byte or
//! bit granularity. It carries one packet's header and payload; this module
//! knows nothing about which field lives where (see [`crate::header`]).
//!
//! ## Access Rules
//!
//! - Numeric fields are little-endian with no alignment requirement.
//! - Bit fields are MSB-first: bit 0 is the most significant bit of byte 0.
//! - A write past the current capacity grows the storage by doubling, so a
//!   long run of small appends stays amortized O(1).
//! - A value wider than its field is rejected, never truncated.
//! - A read past the capacity is an [`PacketError::OutOfBounds`] error;
//!   [`PacketBuffer::get_or_zero`] turns that into `0` for speculative reads
//!   of headers that have not fully arrived yet.

use alloc::vec::Vec;
use core::fmt;

/// Errors raised by packet buffer access and by packet validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketError {
    /// Field width outside the supported range
    InvalidWidth,
    /// Value has bits set above the field width
    ValueTooWide,
    /// Read past the allocated capacity
    OutOfBounds,
    /// Storage growth failed
    AllocFailed,
    /// Packet shorter than its header
    Truncated,
    /// Header length field disagrees with the payload size
    LengthMismatch,
    /// Payload does not fit the 16-bit length field
    TooLarge,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PacketError::InvalidWidth => "invalid field width",
            PacketError::ValueTooWide => "value wider than field",
            PacketError::OutOfBounds => "read past packet capacity",
            PacketError::AllocFailed => "packet allocation failed",
            PacketError::Truncated => "packet shorter than header",
            PacketError::LengthMismatch => "header length does not match payload",
            PacketError::TooLarge => "payload too large for length field",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for PacketError {}

/// Unsigned integer types that can be stored in a packet field
pub trait Field: Copy {
    /// Width in bytes
    const WIDTH: usize;

    fn to_u64(self) -> u64;
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_field {
    ($($t:ty),*) => {
        $(
            impl Field for $t {
                const WIDTH: usize = core::mem::size_of::<$t>();

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_u64(value: u64) -> Self {
                    value as $t
                }
            }
        )*
    };
}

impl_field!(u8, u16, u32, u64);

/// One packet's bytes plus the bookkeeping the session needs for retries.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    created_at: u64,
    retry_count: u8,
    /// High-water mark of written bits
    used_bits: usize,
    data: Vec<u8>,
}

impl PacketBuffer {
    /// Create an empty packet with a capacity of one byte
    pub fn new(now: u64) -> Self {
        Self {
            created_at: now,
            retry_count: 0,
            used_bits: 0,
            data: alloc::vec![0u8; 1],
        }
    }

    /// Create an empty packet with room for `capacity` bytes (at least one)
    pub fn with_capacity(now: u64, capacity: usize) -> Result<Self, PacketError> {
        let mut packet = Self {
            created_at: now,
            retry_count: 0,
            used_bits: 0,
            data: Vec::new(),
        };
        packet.reserve_to(capacity.max(1))?;
        Ok(packet)
    }

    /// Create a packet holding a copy of `bytes`
    pub fn from_bytes(now: u64, bytes: &[u8]) -> Result<Self, PacketError> {
        let mut packet = Self::with_capacity(now, bytes.len())?;
        packet.data[..bytes.len()].copy_from_slice(bytes);
        packet.used_bits = bytes.len() * 8;
        Ok(packet)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far (a partially written byte counts)
    #[inline]
    pub fn len(&self) -> usize {
        self.used_bits.div_ceil(8)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_bits == 0
    }

    #[inline]
    pub fn bits_used(&self) -> usize {
        self.used_bits
    }

    /// The written bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Refresh the timestamp, e.g. when the packet is (re)transmitted
    pub fn touch(&mut self, now: u64) {
        self.created_at = now;
    }

    #[inline]
    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn increment_retry(&mut self) -> u8 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Forget the contents, keeping the allocation
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.used_bits = 0;
    }

    /// Make sure at least `end` bytes are allocated.
    fn ensure(&mut self, end: usize) -> Result<(), PacketError> {
        if end <= self.data.len() {
            return Ok(());
        }
        let target = end.max(self.data.len() * 2).max(1);
        self.reserve_to(target)
    }

    fn reserve_to(&mut self, target: usize) -> Result<(), PacketError> {
        let extra = target.saturating_sub(self.data.len());
        self.data
            .try_reserve_exact(extra)
            .map_err(|_| PacketError::AllocFailed)?;
        self.data.resize(target, 0);
        Ok(())
    }

    fn mark_used(&mut self, end_bit: usize) {
        self.used_bits = self.used_bits.max(end_bit);
    }

    // ---- byte addressed ----

    /// Write the low `width` bytes of `value` at byte `offset`.
    pub fn set(&mut self, value: u64, offset: usize, width: usize) -> Result<(), PacketError> {
        if width > 8 {
            return Err(PacketError::InvalidWidth);
        }
        if width < 8 && value >> (width * 8) != 0 {
            return Err(PacketError::ValueTooWide);
        }
        let end = offset.checked_add(width).ok_or(PacketError::OutOfBounds)?;
        self.ensure(end)?;

        let bytes = value.to_le_bytes();
        self.data[offset..end].copy_from_slice(&bytes[..width]);
        self.mark_used(end * 8);
        Ok(())
    }

    /// Read `width` bytes at byte `offset` as a little-endian integer
    pub fn get(&self, offset: usize, width: usize) -> Result<u64, PacketError> {
        if width > 8 {
            return Err(PacketError::InvalidWidth);
        }
        let end = offset.checked_add(width).ok_or(PacketError::OutOfBounds)?;
        let src = self.data.get(offset..end).ok_or(PacketError::OutOfBounds)?;

        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(src);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Like [`get`](Self::get), but a read past the capacity yields zero
    pub fn get_or_zero(&self, offset: usize, width: usize) -> u64 {
        self.get(offset, width).unwrap_or(0)
    }

    /// Write a typed field
    pub fn put<T: Field>(&mut self, offset: usize, value: T) -> Result<(), PacketError> {
        self.set(value.to_u64(), offset, T::WIDTH)
    }

    /// Read a typed field
    pub fn read<T: Field>(&self, offset: usize) -> Result<T, PacketError> {
        self.get(offset, T::WIDTH).map(T::from_u64)
    }

    /// Write `value` right after the last written byte
    pub fn append(&mut self, value: u64, width: usize) -> Result<(), PacketError> {
        self.set(value, self.len(), width)
    }

    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PacketError> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(PacketError::OutOfBounds)?;
        self.ensure(end)?;
        self.data[offset..end].copy_from_slice(bytes);
        self.mark_used(end * 8);
        Ok(())
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        self.set_bytes(self.len(), bytes)
    }

    /// Borrow `len` bytes starting at `offset`
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], PacketError> {
        let end = offset.checked_add(len).ok_or(PacketError::OutOfBounds)?;
        self.data.get(offset..end).ok_or(PacketError::OutOfBounds)
    }

    // ---- bit addressed ----

    /// Write the low `width` bits of `value` at bit `offset`, MSB first.
    pub fn set_bits(&mut self, value: u64, offset: usize, width: usize) -> Result<(), PacketError> {
        if width > 64 {
            return Err(PacketError::InvalidWidth);
        }
        if width < 64 && value >> width != 0 {
            return Err(PacketError::ValueTooWide);
        }
        let end_bit = offset.checked_add(width).ok_or(PacketError::OutOfBounds)?;
        self.ensure(end_bit.div_ceil(8))?;

        for i in 0..width {
            let bit = (value >> (width - 1 - i)) & 1;
            let pos = offset + i;
            let mask = 0x80u8 >> (pos % 8);
            if bit == 1 {
                self.data[pos / 8] |= mask;
            } else {
                self.data[pos / 8] &= !mask;
            }
        }
        self.mark_used(end_bit);
        Ok(())
    }

    /// Read `width` bits at bit `offset`, MSB first
    pub fn get_bits(&self, offset: usize, width: usize) -> Result<u64, PacketError> {
        if width > 64 {
            return Err(PacketError::InvalidWidth);
        }
        let end_bit = offset.checked_add(width).ok_or(PacketError::OutOfBounds)?;
        if end_bit.div_ceil(8) > self.data.len() {
            return Err(PacketError::OutOfBounds);
        }

        let mut value = 0u64;
        for pos in offset..end_bit {
            let bit = (self.data[pos / 8] >> (7 - pos % 8)) & 1;
            value = (value << 1) | u64::from(bit);
        }
        Ok(value)
    }

    /// Write `value` right after the last written bit
    pub fn append_bits(&mut self, value: u64, width: usize) -> Result<(), PacketError> {
        self.set_bits(value, self.used_bits, width)
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Packets compare by content; timestamps and retry counts are ignored.
impl PartialEq for PacketBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for PacketBuffer {}
