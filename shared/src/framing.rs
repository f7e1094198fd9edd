//! # Framing Codec
//!
//! Turns the raw UART byte stream into [`PacketBuffer`]s and back.
//!
//! ## Wire Format
//!
//! ```text
//! 0xFF │ escaped(header ‖ payload) │ 0xC0
//! ```
//!
//! Escaping is SLIP style (RFC 1055):
//!
//! | raw    | on the wire  |
//! |--------|--------------|
//! | `0xC0` | `0xDB 0xDC`  |
//! | `0xDB` | `0xDB 0xDD`  |
//! | other  | unchanged    |
//!
//! ## Receive State Machine
//!
//! ```text
//!            0xFF                 5 header bytes              len bytes + 0xC0
//! WaitStart ──────► WaitHeader ───────────────────► AccumulateBody ─────────────► WaitStart
//!     ▲                  │ 0xC0 early / stall              │ 0xC0 early / stall   (Complete)
//!     └──────────────────┴─────────────────────────────────┘
//!     ▲
//!     │ 0xC0
//!  Resync ◄── bad escape, oversize, overrun, allocation failure
//! ```
//!
//! Every step is O(1) per byte and never blocks. Errors discard the frame in
//! progress and are only counted; a corrupt frame has no identity to report
//! against.

use alloc::vec::Vec;
use core::fmt;

use crate::byte_ring::{BufferError, ByteRing, Consumer};
use crate::header::{HEADER_SIZE, LENGTH_OFFSET, START_MARKER};
use crate::packet::PacketBuffer;
use crate::ring::CircularBuffer;
use crate::traits::{PortError, SerialPort};

/// Frame delimiter
pub const FRAME_END: u8 = 0xC0;
/// Escape introducer
pub const ESC: u8 = 0xDB;
/// Escaped `FRAME_END`
pub const ESC_END: u8 = 0xDC;
/// Escaped `ESC`
pub const ESC_ESC: u8 = 0xDD;

/// Errors raised while framing or unframing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FramingError {
    /// Delimiter arrived before the declared length was reached, or the body
    /// ran past it
    LengthMismatch,
    /// Frame larger than the configured maximum
    Oversize,
    /// `ESC` followed by anything but `ESC_END`/`ESC_ESC`
    BadEscape,
    /// A started frame did not finish in time
    Stalled,
    /// No room in the transmit ring right now
    TxOverflow,
    /// Packet storage could not grow
    AllocFailed,
    /// The serial port refused a transmit
    Port(PortError),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::LengthMismatch => f.write_str("frame length mismatch"),
            FramingError::Oversize => f.write_str("frame too large"),
            FramingError::BadEscape => f.write_str("invalid escape sequence"),
            FramingError::Stalled => f.write_str("frame timed out"),
            FramingError::TxOverflow => f.write_str("transmit ring full"),
            FramingError::AllocFailed => f.write_str("frame allocation failed"),
            FramingError::Port(err) => write!(f, "serial port: {}", err),
        }
    }
}

impl core::error::Error for FramingError {}

impl From<PortError> for FramingError {
    fn from(err: PortError) -> Self {
        FramingError::Port(err)
    }
}

impl From<BufferError> for FramingError {
    fn from(_: BufferError) -> Self {
        FramingError::TxOverflow
    }
}

// ---- escaping ----

#[derive(Debug, Clone)]
struct EscapedByte {
    pair: [u8; 2],
    next: u8,
    end: u8,
}

impl EscapedByte {
    fn new(byte: u8) -> Self {
        match byte {
            FRAME_END => Self { pair: [ESC, ESC_END], next: 0, end: 2 },
            ESC => Self { pair: [ESC, ESC_ESC], next: 0, end: 2 },
            other => Self { pair: [other, 0], next: 0, end: 1 },
        }
    }
}

impl Iterator for EscapedByte {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.next < self.end {
            let byte = self.pair[usize::from(self.next)];
            self.next += 1;
            Some(byte)
        } else {
            None
        }
    }
}

/// Lazily escape `input`
pub fn escaped(input: &[u8]) -> impl Iterator<Item = u8> + '_ {
    input.iter().flat_map(|&byte| EscapedByte::new(byte))
}

/// Append the escaped form of `input` to `out`
pub fn escape(input: &[u8], out: &mut Vec<u8>) {
    out.reserve(escaped_len(input));
    out.extend(escaped(input));
}

/// Escape `payload` and terminate it with `FRAME_END`
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) {
    escape(payload, out);
    out.push(FRAME_END);
}

/// Size of `input` once escaped
pub fn escaped_len(input: &[u8]) -> usize {
    input.len()
        + input
            .iter()
            .filter(|&&byte| byte == FRAME_END || byte == ESC)
            .count()
}

/// Size on the wire of a packet with these bytes: marker, escaped body and
/// delimiter
pub fn frame_len(packet: &[u8]) -> usize {
    escaped_len(packet) + 2
}

/// Reverse [`escape`]. The input must not contain a raw delimiter.
pub fn unescape(input: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter();
    while let Some(&byte) = bytes.next() {
        match byte {
            ESC => match bytes.next() {
                Some(&ESC_END) => out.push(FRAME_END),
                Some(&ESC_ESC) => out.push(ESC),
                _ => return Err(FramingError::BadEscape),
            },
            FRAME_END => return Err(FramingError::BadEscape),
            other => out.push(other),
        }
    }
    Ok(out)
}

// ---- receive ----

/// Receive state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    /// Looking for the start marker
    WaitStart,
    /// Collecting the fixed-size header
    WaitHeader,
    /// Collecting the declared payload
    AccumulateBody,
    /// Skipping a corrupt frame up to its delimiter
    Resync,
}

/// Outcome of feeding one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Decoded {
    /// Byte consumed, nothing to report
    Pending,
    /// A frame completed and was queued
    Complete,
    /// The frame in progress was dropped
    Discarded(FramingError),
    /// Byte arrived outside any frame
    Misaligned,
}

/// Decoder counters, folded into [`LinkStats`](crate::stats::LinkStats)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DecoderStats {
    pub frames: u32,
    pub framing_errors: u32,
    pub misaligned_bytes: u32,
    /// Completed frames overwritten before being popped
    pub completed_overflows: u32,
}

/// Byte-at-a-time frame decoder feeding a queue of completed packets
#[derive(Debug)]
pub struct FrameDecoder {
    state: RxState,
    current: Option<PacketBuffer>,
    received: usize,
    expected: usize,
    escaped: bool,
    started_at: u64,
    max_frame_size: usize,
    stall_timeout: u64,
    completed: CircularBuffer<PacketBuffer>,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// `max_frame_size` bounds the unescaped header + payload,
    /// `stall_timeout` bounds how long a started frame may take.
    pub fn new(max_frame_size: usize, stall_timeout: u64, completed_capacity: usize) -> Self {
        Self {
            state: RxState::WaitStart,
            current: None,
            received: 0,
            expected: 0,
            escaped: false,
            started_at: 0,
            max_frame_size: max_frame_size.max(HEADER_SIZE),
            stall_timeout,
            completed: CircularBuffer::new(completed_capacity),
            stats: DecoderStats::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> RxState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Completed frames waiting to be popped
    pub fn completed_len(&self) -> usize {
        self.completed.unread()
    }

    pub fn pop(&mut self) -> Option<PacketBuffer> {
        self.completed.read()
    }

    /// Drop the frame in progress and every completed frame
    pub fn reset(&mut self) {
        self.abandon(RxState::WaitStart);
        self.completed.clear();
    }

    /// Feed one wire byte
    pub fn feed(&mut self, byte: u8, now: u64) -> Decoded {
        match self.state {
            RxState::WaitStart => match byte {
                START_MARKER => self.start(now),
                FRAME_END => Decoded::Pending,
                _ => {
                    self.stats.misaligned_bytes = self.stats.misaligned_bytes.wrapping_add(1);
                    trace!("misaligned byte {}", byte);
                    Decoded::Misaligned
                }
            },
            RxState::Resync => {
                if byte == FRAME_END {
                    self.state = RxState::WaitStart;
                }
                Decoded::Pending
            }
            RxState::WaitHeader | RxState::AccumulateBody => self.feed_frame(byte),
        }
    }

    /// Feed a run of bytes, returning how many frames completed
    pub fn feed_slice(&mut self, bytes: &[u8], now: u64) -> usize {
        bytes
            .iter()
            .filter(|&&byte| self.feed(byte, now) == Decoded::Complete)
            .count()
    }

    /// Drain everything readable from the receive ring
    pub fn drain<const N: usize>(&mut self, rx: &mut Consumer<'_, N>, now: u64) -> usize {
        let mut frames = 0;
        while let Some(chunk) = rx.readable_slice(N) {
            let len = chunk.len();
            frames += self.feed_slice(chunk, now);
            if rx.consume(len).is_err() {
                break;
            }
        }
        frames
    }

    /// Drop a frame that started more than `stall_timeout` ago
    pub fn poll_timeout(&mut self, now: u64) -> Option<FramingError> {
        let in_frame = matches!(self.state, RxState::WaitHeader | RxState::AccumulateBody);
        if in_frame && now.saturating_sub(self.started_at) >= self.stall_timeout {
            self.fail(FramingError::Stalled, RxState::WaitStart);
            return Some(FramingError::Stalled);
        }
        None
    }

    fn start(&mut self, now: u64) -> Decoded {
        self.abandon(RxState::WaitHeader);
        self.started_at = now;
        match PacketBuffer::with_capacity(now, HEADER_SIZE) {
            Ok(packet) => {
                self.current = Some(packet);
                Decoded::Pending
            }
            Err(_) => self.fail(FramingError::AllocFailed, RxState::Resync),
        }
    }

    fn feed_frame(&mut self, byte: u8) -> Decoded {
        if byte == FRAME_END {
            if self.escaped {
                return self.fail(FramingError::BadEscape, RxState::WaitStart);
            }
            if self.state == RxState::AccumulateBody && self.received == self.expected {
                return self.complete();
            }
            return self.fail(FramingError::LengthMismatch, RxState::WaitStart);
        }

        let value = if self.escaped {
            self.escaped = false;
            match byte {
                ESC_END => FRAME_END,
                ESC_ESC => ESC,
                _ => return self.fail(FramingError::BadEscape, RxState::Resync),
            }
        } else if byte == ESC {
            self.escaped = true;
            return Decoded::Pending;
        } else {
            byte
        };

        self.store(value)
    }

    fn store(&mut self, value: u8) -> Decoded {
        if self.state == RxState::AccumulateBody && self.received >= self.expected {
            return self.fail(FramingError::LengthMismatch, RxState::Resync);
        }
        if self.received >= self.max_frame_size {
            return self.fail(FramingError::Oversize, RxState::Resync);
        }

        let appended = match self.current.as_mut() {
            Some(packet) => packet.append(u64::from(value), 1).is_ok(),
            None => false,
        };
        if !appended {
            return self.fail(FramingError::AllocFailed, RxState::Resync);
        }
        self.received += 1;

        if self.state == RxState::WaitHeader && self.received == HEADER_SIZE {
            let length = self
                .current
                .as_ref()
                .map_or(0, |packet| packet.get_or_zero(LENGTH_OFFSET, 2));
            self.expected = HEADER_SIZE + length as usize;
            if self.expected > self.max_frame_size {
                return self.fail(FramingError::Oversize, RxState::Resync);
            }
            self.state = RxState::AccumulateBody;
        }
        Decoded::Pending
    }

    fn complete(&mut self) -> Decoded {
        let packet = self.current.take();
        self.abandon(RxState::WaitStart);
        if let Some(packet) = packet {
            self.stats.frames = self.stats.frames.wrapping_add(1);
            if self.completed.write(packet).is_some() {
                self.stats.completed_overflows = self.stats.completed_overflows.wrapping_add(1);
                warn!("completed frame queue full, oldest frame dropped");
            }
        }
        Decoded::Complete
    }

    fn fail(&mut self, err: FramingError, next: RxState) -> Decoded {
        self.abandon(next);
        self.stats.framing_errors = self.stats.framing_errors.wrapping_add(1);
        debug!("framing error: {:?}", err);
        Decoded::Discarded(err)
    }

    fn abandon(&mut self, next: RxState) {
        self.current = None;
        self.received = 0;
        self.expected = 0;
        self.escaped = false;
        self.state = next;
    }
}

// ---- transmit ----

/// Frames packets into an `N`-byte transmit ring and drains it to a
/// [`SerialPort`] in chunks.
///
/// Bytes handed to the port stay reserved in the ring until
/// [`transmit_complete`](Self::transmit_complete), so a chunk is never
/// re-sent or skipped across interrupt boundaries.
pub struct FrameEncoder<const N: usize> {
    ring: ByteRing<N>,
    in_flight: usize,
    max_chunk: usize,
}

impl<const N: usize> FrameEncoder<N> {
    pub fn new(max_chunk: usize) -> Self {
        Self {
            ring: ByteRing::new(),
            in_flight: 0,
            max_chunk: max_chunk.clamp(1, N),
        }
    }

    /// Frame `packet` into the ring.
    ///
    /// Nothing is written unless the whole frame fits. Returns the framed size.
    pub fn encode(&mut self, packet: &PacketBuffer) -> Result<usize, FramingError> {
        let bytes = packet.as_bytes();
        let total = frame_len(bytes);
        if total > N {
            return Err(FramingError::Oversize);
        }

        let (mut producer, _) = self.ring.split();
        if total > producer.writable_len() {
            return Err(FramingError::TxOverflow);
        }

        let frame = core::iter::once(START_MARKER)
            .chain(escaped(bytes))
            .chain(core::iter::once(FRAME_END));
        let mut region = producer.writable_split(total);
        for (slot, byte) in region.iter_mut().zip(frame) {
            *slot = byte;
        }
        producer.commit(total)?;
        Ok(total)
    }

    /// Hand the next chunk to `port` if nothing is in flight.
    ///
    /// Returns the number of bytes handed over.
    pub fn poll_transmit<P: SerialPort>(&mut self, port: &mut P) -> Result<usize, FramingError> {
        if self.in_flight > 0 {
            return Ok(0);
        }
        let max_chunk = self.max_chunk;
        let (_, consumer) = self.ring.split();
        let Some(chunk) = consumer.readable_slice(max_chunk) else {
            return Ok(0);
        };
        let len = chunk.len();
        port.begin_transmit(chunk)?;
        self.in_flight = len;
        Ok(len)
    }

    /// Release the in-flight chunk after the hardware finished sending it
    pub fn transmit_complete(&mut self) {
        if self.in_flight == 0 {
            return;
        }
        let in_flight = core::mem::take(&mut self.in_flight);
        let (_, mut consumer) = self.ring.split();
        if consumer.consume(in_flight).is_err() {
            error!("transmit ring lost track of {} in-flight bytes", in_flight);
        }
    }

    /// Framed bytes not yet handed to the port
    pub fn unsent(&self) -> usize {
        self.ring.readable_len() - self.in_flight
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Room left for new frames
    pub fn writable_len(&self) -> usize {
        self.ring.writable_len()
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.ring.is_empty()
    }

    /// Drop everything queued, including the in-flight chunk
    pub fn reset(&mut self) {
        self.ring.reset();
        self.in_flight = 0;
    }
}

impl<const N: usize> Default for FrameEncoder<N> {
    fn default() -> Self {
        Self::new(N)
    }
}
