//! Link configuration.

use serde::{Deserialize, Serialize};

/// Tunables for one [`Session`](crate::session::Session).
///
/// Timeouts are in the same millisecond clock the caller passes as `now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct LinkConfig {
    /// How long a sent packet waits for its acknowledgment
    pub ack_timeout_ms: u64,
    /// Retransmissions before a packet is reported as failed
    pub max_retries: u8,
    /// A started frame that does not finish within this window is dropped
    pub rx_frame_timeout_ms: u64,
    /// Largest unescaped header + payload accepted or sent
    pub max_frame_size: usize,
    /// Packets waiting for transmission
    pub outbound_capacity: usize,
    /// Capacity of each receive queue
    pub rx_queue_capacity: usize,
    /// Decoded frames waiting for dispatch
    pub completed_capacity: usize,
    /// Undelivered [`LinkEvent`](crate::session::LinkEvent)s
    pub event_capacity: usize,
    /// Bytes handed to the port per transmit
    pub tx_chunk_size: usize,
    /// Acknowledge ack-requiring packets as they are dispatched
    pub auto_ack: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            max_retries: 3,
            rx_frame_timeout_ms: 5_000,
            max_frame_size: 4096,
            outbound_capacity: 16,
            rx_queue_capacity: 8,
            completed_capacity: 8,
            event_capacity: 16,
            tx_chunk_size: 256,
            auto_ack: true,
        }
    }
}

impl LinkConfig {
    /// Clamp sizes that must never be zero
    pub fn validate(mut self) -> Self {
        self.max_frame_size = self.max_frame_size.max(crate::header::HEADER_SIZE);
        self.outbound_capacity = self.outbound_capacity.max(1);
        self.rx_queue_capacity = self.rx_queue_capacity.max(1);
        self.completed_capacity = self.completed_capacity.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self.tx_chunk_size = self.tx_chunk_size.max(1);
        self
    }
}
