//! # Serial Link Transport
//!
//! Packet transport for the serial link between the network chip and the UI
//! chip. Every feature crossing the board travels as a link packet:
//!
//! - **Byte Ring**: lock-free SPSC ring between the UART interrupt and the
//!   poll task
//! - **Framing Codec**: SLIP-style escaping with a start marker and a length
//!   checked header
//! - **Packet Session**: type/sub-type routing into bounded queues, auto-ack,
//!   timeout based retransmission and delivery events
//!
//! ## Architecture
//!
//! ```text
//!  UART IRQ ──commit(n)──► ByteRing ──► FrameDecoder ──► Session ──► per-type queues
//!                                                          │              │
//!                                                          │        application
//!                                                          ▼              │
//!  UART TX ◄── SerialPort ◄── FrameEncoder ◄── outbound queue ◄───────────┘
//! ```
//!
//! ## Memory Strategy
//!
//! 1. Every queue is a fixed-capacity [`CircularBuffer`] sized at startup
//! 2. The only structure touched by two execution contexts is the
//!    [`ByteRing`], guarded by acquire/release atomics instead of a lock
//! 3. Packets are the only heap allocations; their growth failures are
//!    reported as errors, never as aborts
//! 4. Overflow anywhere is counted in [`LinkStats`] rather than treated as fatal

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod byte_ring;
pub mod config;
pub mod framing;
pub mod header;
pub mod packet;
pub mod pending;
pub mod ring;
pub mod session;
pub mod stats;
pub mod traits;

// Re-export main types for convenience
pub use byte_ring::{BufferError, ByteRing, Consumer, Producer};
pub use config::LinkConfig;
pub use framing::{FrameDecoder, FrameEncoder, FramingError, RxState};
pub use header::{CommandType, Header, MessageType, PacketType};
pub use packet::{PacketBuffer, PacketError};
pub use pending::MAX_PENDING;
pub use ring::CircularBuffer;
pub use session::{LinkError, LinkEvent, QueueSelector, Session, TxStatus};
pub use stats::LinkStats;
pub use traits::{BlockingPort, PortError, SerialPort};

/// Library version for link compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
