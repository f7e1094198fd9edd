//! # Serial Link Host Driver
//!
//! Runs a [`serial_link::Session`] on a std target over any
//! `AsyncRead + AsyncWrite` stream: a USB-serial adapter, a TCP socket to a
//! bench rig, or `tokio::io::duplex` in tests.
//!
//! ## Task Layout
//!
//! ```text
//! ┌───────────────────────── link task ─────────────────────────┐
//! │                                                             │
//! │  read half ──► Producer ══ ByteRing ══ Consumer ──┐         │
//! │                                                   ▼         │
//! │  every poll_interval:                    Mutex<Session>     │
//! │      session.poll(consumer, now)                  │         │
//! │      StreamPort chunk ──► mpsc(1) ──┐             │         │
//! │      notify waiters                 │             │         │
//! └─────────────────────────────────────┼─────────────┼─────────┘
//!                                       ▼             │
//! ┌──────────── writer task ────────────────────────┐ │
//! │  write_all ──► mark_complete + poll_tx ─────────┼─┘
//! └─────────────────────────────────────────────────┘
//!            ▲                                   │
//!            │ send / register_queue             │ recv / recv_event
//!            └──────────── LinkHandle ◄──────────┘
//! ```
//!
//! A write blocked on a slow peer never stops reads. The session lock is
//! never held across an `.await`. Dropping the [`LinkHandle`] stops the link.
//!
//! ```ignore
//! let (stream, _) = listener.accept().await?;
//! let link = LinkHost::spawn(stream, HostConfig::default());
//! link.register_queue(CommandType::Ssids.into())?;
//! let id = link.send(PacketType::Command, &[CommandType::WifiStatus as u8])?;
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod port;

pub use config::HostConfig;
pub use driver::{HostSession, LinkHandle, LinkHost, RX_RING_SIZE, TX_RING_SIZE};
pub use error::{HostError, Result};
pub use port::StreamPort;
