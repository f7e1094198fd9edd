//! # Hardware Collaborator Traits
//!
//! The transport never touches a UART directly. Receive bytes arrive through
//! the [`crate::byte_ring`] producer (the interrupt calls
//! [`Producer::commit`](crate::byte_ring::Producer::commit) as its
//! `on_bytes_available` hook); transmit goes through [`SerialPort`].
//!
//! ## Transmit Handshake
//!
//! ```text
//!  FrameEncoder                 SerialPort                  hardware
//!      │ begin_transmit(chunk)      │                            │
//!      │───────────────────────────►│ start DMA / FIFO fill      │
//!      │                            │───────────────────────────►│
//!      │                            │◄──── tx complete IRQ ──────│
//!      │ poll_complete() == true    │                            │
//!      │◄───────────────────────────│                            │
//!      │ release chunk, send next   │                            │
//! ```
//!
//! `begin_transmit` must copy or otherwise pin the chunk before returning;
//! the encoder keeps the bytes reserved until completion is observed but does
//! not keep the borrow alive.

use core::fmt;

/// Errors reported by a serial port implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortError {
    /// A previous transmission is still running
    Busy,
    /// The peer or the peripheral went away
    Disconnected,
    /// Generic I/O failure
    Io,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortError::Busy => f.write_str("port busy"),
            PortError::Disconnected => f.write_str("port disconnected"),
            PortError::Io => f.write_str("port i/o error"),
        }
    }
}

impl core::error::Error for PortError {}

/// Transmit half of a serial peripheral
pub trait SerialPort {
    /// Start sending `bytes`. Completion is reported later by
    /// [`poll_complete`](Self::poll_complete).
    fn begin_transmit(&mut self, bytes: &[u8]) -> Result<(), PortError>;

    /// Returns `true` exactly once per finished transmission.
    ///
    /// Called from the poll task; implementations typically read a flag set
    /// by the transmit-complete interrupt.
    fn poll_complete(&mut self) -> bool;
}

impl<P: SerialPort + ?Sized> SerialPort for &mut P {
    fn begin_transmit(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        (**self).begin_transmit(bytes)
    }

    fn poll_complete(&mut self) -> bool {
        (**self).poll_complete()
    }
}

/// [`SerialPort`] over any blocking [`embedded_io::Write`].
///
/// Each transmit is written and flushed before `begin_transmit` returns, so
/// the next `poll_complete` always reports completion.
pub struct BlockingPort<W> {
    writer: W,
    complete: bool,
}

impl<W: embedded_io::Write> BlockingPort<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            complete: false,
        }
    }

    pub fn inner(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: embedded_io::Write> SerialPort for BlockingPort<W> {
    fn begin_transmit(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        self.writer.write_all(bytes).map_err(|_| PortError::Io)?;
        self.writer.flush().map_err(|_| PortError::Io)?;
        self.complete = true;
        Ok(())
    }

    fn poll_complete(&mut self) -> bool {
        core::mem::replace(&mut self.complete, false)
    }
}
