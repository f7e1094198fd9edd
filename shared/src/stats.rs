//! Link diagnostics counters.
//!
//! Nothing in the transport is fatal; every dropped byte, frame or packet is
//! counted here instead. The counters serialize with `postcard` so one chip
//! can ship its view of the link to the other inside a `Debug` packet.
//!
//! A report starts with [`REPORT_TAG`], a byte that never begins a text
//! debug line, followed by the postcard encoding.

use serde::{Deserialize, Serialize};

/// Upper bound of [`LinkStats::encode`] and [`LinkStats::encode_report`] output
pub const MAX_ENCODED: usize = 128;

/// First payload byte of a stats report
pub const REPORT_TAG: u8 = 0x00;

/// Statistics about the link since the session started
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkStats {
    /// Packets decoded and dispatched
    pub packets_received: u32,
    /// Frames handed to the encoder
    pub packets_sent: u32,
    /// Framed bytes handed to the encoder
    pub bytes_sent: u64,
    /// Frames discarded by the decoder
    pub framing_errors: u32,
    /// Bytes seen outside any frame
    pub misaligned_bytes: u32,
    /// Debug and local debug packets consumed without queuing
    pub debug_discarded: u32,
    /// Frames whose header disagreed with their size
    pub malformed_packets: u32,
    /// Receive queue entries overwritten before being read
    pub rx_queue_overflows: u32,
    /// Outbound packets rejected because the queue was full
    pub outbound_overflows: u32,
    pub acks_received: u32,
    pub nacks_received: u32,
    pub busy_received: u32,
    /// Acknowledgments for ids that were not pending
    pub unmatched_acks: u32,
    pub retransmissions: u32,
    pub delivery_failures: u32,
    /// Link events overwritten before being read
    pub event_overflows: u32,
}

impl LinkStats {
    /// Serialize into `buf`, returning the used prefix
    pub fn encode<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Serialize as a tagged report payload
    pub fn encode_report<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], postcard::Error> {
        let (tag, body) = buf
            .split_first_mut()
            .ok_or(postcard::Error::SerializeBufferFull)?;
        *tag = REPORT_TAG;
        let len = self.encode(body)?.len();
        Ok(&mut buf[..len + 1])
    }

    /// Parse a `Debug` payload produced by [`encode_report`](Self::encode_report).
    ///
    /// Anything else, including a report with trailing bytes, yields `None`.
    pub fn decode_report(payload: &[u8]) -> Option<Self> {
        match payload.split_first() {
            Some((&REPORT_TAG, body)) => match postcard::take_from_bytes(body) {
                Ok((stats, [])) => Some(stats),
                _ => None,
            },
            _ => None,
        }
    }
}
