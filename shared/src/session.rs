//! # Packet Session Manager
//!
//! The protocol layer above framing. One [`Session`] owns everything on the
//! task side of the link:
//!
//! ```text
//!  rx Consumer ──► FrameDecoder ──► dispatch ──┬──► general queue
//!                                              ├──► Command(n) / Message(n) / Setting(n) queues
//!                                              ├──► ack bookkeeping ──► LinkEvent queue
//!                                              └──► auto-ack ──┐
//!                                                              ▼
//!  application ──► enqueue_outbound ──────────────────► outbound queue
//!                                                              │ transmit_next
//!                                                              ▼
//!  SerialPort ◄── FrameEncoder ◄───────────────────────────────┘
//!                      │ ack-requiring packets
//!                      ▼
//!                 PendingTable ── timeout / Nack ──► outbound queue (retry)
//! ```
//!
//! ## Delivery Rules
//!
//! - Packets of ack-requiring types stay in the [`PendingTable`] after they
//!   are framed. An `Ok` carrying their id completes them.
//! - An entry whose last transmission is `ack_timeout_ms` old is re-queued
//!   with its retry count incremented, until `max_retries` retransmissions
//!   have been made. The next expiry reports [`LinkEvent::DeliveryFailed`].
//! - An `Error` (Nack) re-queues immediately and counts as a retry.
//! - A `Busy` re-arms the timeout without consuming a retry.
//! - The outbound queue never grows: a full queue rejects new packets and
//!   defers retries to a later tick.
//! - No entry outlives `(max_retries + 1) * ack_timeout_ms` from its first
//!   transmission. Deferred retries and `Busy` replies cannot extend that.
//! - An entry stays pending while its retransmission waits in the outbound
//!   queue, so its id is never handed out again in the meantime.
//!
//! Nothing here blocks; every call does a bounded amount of work on data
//! that is already buffered.

use core::fmt;

use heapless::LinearMap;

use crate::byte_ring::Consumer;
use crate::config::LinkConfig;
use crate::framing::{FrameDecoder, FrameEncoder, FramingError, RxState};
use crate::header::{
    self, build_ack, build_packet, CommandType, Header, MessageType, PacketType, ID_WRAP,
    PAYLOAD_OFFSET,
};
use crate::packet::{PacketBuffer, PacketError};
use crate::pending::PendingTable;
use crate::ring::CircularBuffer;
use crate::stats::{LinkStats, MAX_ENCODED};
use crate::traits::SerialPort;

/// Named receive queues a session can hold besides the general one
pub const MAX_QUEUES: usize = 16;

/// Errors returned by session operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// The outbound queue is full; the packet was dropped
    OutboundFull,
    /// The packet is malformed or could not be built
    Packet(PacketError),
    /// The packet cannot be framed
    Framing(FramingError),
    /// No room for another named queue
    TooManyQueues,
    /// Diagnostics could not be serialized
    Encode,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::OutboundFull => f.write_str("outbound queue full"),
            LinkError::Packet(err) => write!(f, "packet: {}", err),
            LinkError::Framing(err) => write!(f, "framing: {}", err),
            LinkError::TooManyQueues => f.write_str("too many receive queues"),
            LinkError::Encode => f.write_str("stats encoding failed"),
        }
    }
}

impl core::error::Error for LinkError {}

impl From<PacketError> for LinkError {
    fn from(err: PacketError) -> Self {
        LinkError::Packet(err)
    }
}

impl From<FramingError> for LinkError {
    fn from(err: FramingError) -> Self {
        LinkError::Framing(err)
    }
}

/// Names a receive queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueSelector {
    /// Everything without a registered sub-type queue
    General,
    Command(u8),
    Message(u8),
    Setting(u8),
}

impl QueueSelector {
    /// The queue a packet of `kind` with first payload byte `sub_type`
    /// belongs to, before registration is taken into account
    pub fn for_packet(kind: PacketType, sub_type: Option<u8>) -> Self {
        match (kind, sub_type) {
            (PacketType::Command, Some(sub)) => QueueSelector::Command(sub),
            (PacketType::Message, Some(sub)) => QueueSelector::Message(sub),
            (PacketType::Setting, Some(sub)) => QueueSelector::Setting(sub),
            _ => QueueSelector::General,
        }
    }
}

impl From<CommandType> for QueueSelector {
    fn from(command: CommandType) -> Self {
        QueueSelector::Command(command as u8)
    }
}

impl From<MessageType> for QueueSelector {
    fn from(message: MessageType) -> Self {
        QueueSelector::Message(message as u8)
    }
}

/// Delivery outcome of an ack-requiring packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    /// The peer acknowledged the packet
    Delivered { id: u16 },
    /// Retries ran out, or the packet could not be framed
    DeliveryFailed { id: u16, kind: PacketType },
}

/// Outcome of the last transmit step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    /// Nothing to send
    Empty,
    /// The transmit ring has no room for the next frame
    Busy,
    /// At least one packet was framed
    Sent,
    /// The next packet needs an ack slot and the pending table is full
    Waiting,
}

enum Step {
    Sent,
    Dropped,
    Stop(TxStatus),
}

/// Packet session over port `P` with a `TX`-byte transmit ring
pub struct Session<P: SerialPort, const TX: usize> {
    port: P,
    config: LinkConfig,
    decoder: FrameDecoder,
    encoder: FrameEncoder<TX>,
    general: CircularBuffer<PacketBuffer>,
    routes: LinearMap<QueueSelector, CircularBuffer<PacketBuffer>, MAX_QUEUES>,
    outbound: CircularBuffer<PacketBuffer>,
    pending: PendingTable,
    events: CircularBuffer<LinkEvent>,
    next_id: u16,
    tx_status: TxStatus,
    stats: LinkStats,
    peer_stats: Option<LinkStats>,
}

impl<P: SerialPort, const TX: usize> Session<P, TX> {
    pub fn new(port: P, config: LinkConfig) -> Self {
        let config = config.validate();
        Self {
            port,
            decoder: FrameDecoder::new(
                config.max_frame_size,
                config.rx_frame_timeout_ms,
                config.completed_capacity,
            ),
            encoder: FrameEncoder::new(config.tx_chunk_size),
            general: CircularBuffer::new(config.rx_queue_capacity),
            routes: LinearMap::new(),
            outbound: CircularBuffer::new(config.outbound_capacity),
            pending: PendingTable::new(),
            events: CircularBuffer::new(config.event_capacity),
            next_id: 1,
            tx_status: TxStatus::Empty,
            stats: LinkStats::default(),
            peer_stats: None,
            config,
        }
    }

    /// Give packets matching `selector` their own queue.
    ///
    /// Until a sub-type is registered its packets land in the general queue.
    pub fn register_queue(&mut self, selector: QueueSelector) -> Result<(), LinkError> {
        if selector == QueueSelector::General || self.routes.contains_key(&selector) {
            return Ok(());
        }
        self.routes
            .insert(selector, CircularBuffer::new(self.config.rx_queue_capacity))
            .map_err(|_| LinkError::TooManyQueues)?;
        debug!("registered queue {:?}", selector);
        Ok(())
    }

    // ---- receive ----

    /// Receive then transmit. Returns the number of packets dispatched.
    pub fn poll<const N: usize>(&mut self, rx: &mut Consumer<'_, N>, now: u64) -> usize {
        let received = self.poll_rx(rx, now);
        self.poll_tx(now);
        received
    }

    /// Drain the receive ring and dispatch every completed frame
    pub fn poll_rx<const N: usize>(&mut self, rx: &mut Consumer<'_, N>, now: u64) -> usize {
        self.check_stall(now);
        self.decoder.drain(rx, now);
        self.dispatch_completed(now)
    }

    /// Like [`poll_rx`](Self::poll_rx) for bytes that did not come through a
    /// ring
    pub fn receive_bytes(&mut self, bytes: &[u8], now: u64) -> usize {
        self.check_stall(now);
        self.decoder.feed_slice(bytes, now);
        self.dispatch_completed(now)
    }

    /// Dispatch a locally built packet as if it had arrived on the wire.
    ///
    /// No acknowledgment is sent for it.
    pub fn loopback(&mut self, packet: PacketBuffer, now: u64) -> bool {
        self.dispatch(packet, now, false)
    }

    fn check_stall(&mut self, now: u64) {
        if let Some(err) = self.decoder.poll_timeout(now) {
            debug!("dropped partial frame: {:?}", err);
        }
    }

    fn dispatch_completed(&mut self, now: u64) -> usize {
        let mut dispatched = 0;
        while let Some(packet) = self.decoder.pop() {
            if self.dispatch(packet, now, self.config.auto_ack) {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Classify one packet. Returns `false` if it was malformed.
    fn dispatch(&mut self, packet: PacketBuffer, now: u64, ack: bool) -> bool {
        let header = match header::validate(&packet) {
            Ok(header) => header,
            Err(err) => {
                self.stats.malformed_packets = self.stats.malformed_packets.wrapping_add(1);
                debug!("dropping malformed packet: {:?}", err);
                return false;
            }
        };
        self.stats.packets_received = self.stats.packets_received.wrapping_add(1);
        trace!("rx {:?} id={} len={}", header.kind, header.id, header.length);

        match header.kind {
            PacketType::LocalDebug => {
                self.stats.debug_discarded = self.stats.debug_discarded.wrapping_add(1);
            }
            PacketType::Debug => {
                if ack {
                    self.acknowledge(header.id, now);
                }
                self.stats.debug_discarded = self.stats.debug_discarded.wrapping_add(1);
                let text = packet
                    .bytes(PAYLOAD_OFFSET, usize::from(header.length))
                    .unwrap_or(&[]);
                if let Some(report) = LinkStats::decode_report(text) {
                    debug!("peer stats: {:?}", report);
                    self.peer_stats = Some(report);
                } else {
                    match core::str::from_utf8(text) {
                        Ok(text) => info!("peer: {}", text),
                        Err(_) => debug!("peer sent {} bytes of binary debug", text.len()),
                    }
                }
            }
            PacketType::Ok => self.handle_ack(&packet),
            PacketType::Error => self.handle_nack(&packet),
            PacketType::Busy => self.handle_busy(&packet, now),
            PacketType::Command
            | PacketType::Message
            | PacketType::Setting
            | PacketType::Unknown(_) => {
                if ack {
                    self.acknowledge(header.id, now);
                }
                self.route(header.kind, packet);
            }
        }
        true
    }

    fn route(&mut self, kind: PacketType, packet: PacketBuffer) {
        let selector = QueueSelector::for_packet(kind, header::sub_type(&packet));
        let queue = match self.routes.get_mut(&selector) {
            Some(queue) => queue,
            None => &mut self.general,
        };
        if queue.write(packet).is_some() {
            self.stats.rx_queue_overflows = self.stats.rx_queue_overflows.wrapping_add(1);
            warn!("receive queue {:?} full, oldest packet dropped", selector);
        }
    }

    fn acknowledge(&mut self, acked_id: u16, now: u64) {
        let id = self.next_packet_id();
        let result = build_ack(PacketType::Ok, id, acked_id, now)
            .map_err(LinkError::from)
            .and_then(|ack| self.enqueue_outbound(ack));
        if let Err(err) = result {
            warn!("could not acknowledge packet {}: {:?}", acked_id, err);
        }
    }

    fn handle_ack(&mut self, packet: &PacketBuffer) {
        self.stats.acks_received = self.stats.acks_received.wrapping_add(1);
        let removed = header::acked_id(packet).and_then(|id| self.pending.remove(id));
        match removed {
            Some(entry) => {
                trace!("packet {} delivered", entry.id);
                self.push_event(LinkEvent::Delivered { id: entry.id });
            }
            None => self.unmatched(),
        }
    }

    fn handle_nack(&mut self, packet: &PacketBuffer) {
        self.stats.nacks_received = self.stats.nacks_received.wrapping_add(1);
        let Some(id) = header::acked_id(packet).filter(|&id| self.pending.contains(id)) else {
            self.unmatched();
            return;
        };
        debug!("peer rejected packet {}", id);
        self.retry(id);
    }

    fn handle_busy(&mut self, packet: &PacketBuffer, now: u64) {
        self.stats.busy_received = self.stats.busy_received.wrapping_add(1);
        let entry = header::acked_id(packet).and_then(|id| self.pending.get_mut(id));
        match entry {
            Some(entry) => entry.packet.touch(now),
            None => self.unmatched(),
        }
    }

    fn unmatched(&mut self) {
        self.stats.unmatched_acks = self.stats.unmatched_acks.wrapping_add(1);
    }

    // ---- transmit ----

    /// Queue a packet for transmission.
    ///
    /// Never blocks. A full queue drops `packet` and returns
    /// [`LinkError::OutboundFull`].
    pub fn enqueue_outbound(&mut self, packet: PacketBuffer) -> Result<(), LinkError> {
        header::validate(&packet)?;
        if packet.len() > self.config.max_frame_size {
            return Err(LinkError::Framing(FramingError::Oversize));
        }
        if self.outbound.is_full() {
            self.stats.outbound_overflows = self.stats.outbound_overflows.wrapping_add(1);
            warn!("outbound queue full, packet dropped");
            return Err(LinkError::OutboundFull);
        }
        self.outbound.write(packet);
        Ok(())
    }

    /// Build a packet with a fresh id and queue it. Returns the id.
    pub fn send(&mut self, kind: PacketType, payload: &[u8], now: u64) -> Result<u16, LinkError> {
        let id = self.next_packet_id();
        self.enqueue_outbound(build_packet(kind, id, payload, now)?)?;
        Ok(id)
    }

    /// Retry expired packets, frame what fits and feed the port.
    ///
    /// Returns the number of packets framed.
    pub fn poll_tx(&mut self, now: u64) -> usize {
        if self.port.poll_complete() {
            self.encoder.transmit_complete();
        }
        self.expire_pending(now);

        let mut sent = 0;
        let status = loop {
            match self.transmit_next(now) {
                Step::Sent => sent += 1,
                Step::Dropped => {}
                Step::Stop(status) => break status,
            }
        };
        self.tx_status = if sent > 0 && status == TxStatus::Empty {
            TxStatus::Sent
        } else {
            status
        };

        if let Err(err) = self.encoder.poll_transmit(&mut self.port) {
            warn!("transmit failed: {:?}", err);
        }
        sent
    }

    /// Release the in-flight chunk; for ports that signal completion out of
    /// band instead of through [`SerialPort::poll_complete`]
    pub fn on_transmit_complete(&mut self) {
        self.encoder.transmit_complete();
    }

    fn transmit_next(&mut self, now: u64) -> Step {
        let Some(packet) = self.outbound.peek() else {
            return Step::Stop(TxStatus::Empty);
        };
        let (kind, id) = match Header::read(packet) {
            Ok(header) => (header.kind, header.id),
            Err(_) => {
                self.outbound.read();
                self.stats.malformed_packets = self.stats.malformed_packets.wrapping_add(1);
                return Step::Dropped;
            }
        };
        let needs_ack = kind.requires_ack();
        let resend = needs_ack && packet.retry_count() > 0;
        if resend && !self.pending.contains(id) {
            // Acknowledged or given up while the copy was queued
            self.outbound.read();
            return Step::Dropped;
        }
        if needs_ack && !resend && self.pending.is_full() {
            return Step::Stop(TxStatus::Waiting);
        }

        match self.encoder.encode(packet) {
            Ok(framed) => {
                let Some(mut packet) = self.outbound.read() else {
                    return Step::Stop(TxStatus::Empty);
                };
                self.stats.packets_sent = self.stats.packets_sent.wrapping_add(1);
                self.stats.bytes_sent = self.stats.bytes_sent.wrapping_add(framed as u64);
                trace!("tx {:?} id={} ({} bytes framed)", kind, id, framed);

                if resend {
                    if let Some(entry) = self.pending.get_mut(id) {
                        entry.packet.touch(now);
                        entry.requeued = false;
                    }
                } else if needs_ack {
                    packet.touch(now);
                    match self.pending.insert(id, packet) {
                        Ok(None) => {}
                        Ok(Some(_)) => warn!("packet id {} reused while pending", id),
                        Err(_) => self.fail_delivery(id, kind),
                    }
                }
                Step::Sent
            }
            Err(FramingError::TxOverflow) => Step::Stop(TxStatus::Busy),
            Err(err) => {
                self.outbound.read();
                warn!("dropping packet {}: {:?}", id, err);
                if needs_ack {
                    self.pending.remove(id);
                    self.fail_delivery(id, kind);
                }
                Step::Dropped
            }
        }
    }

    fn expire_pending(&mut self, now: u64) {
        for id in self.pending.outlived(now, self.lifetime()) {
            self.give_up(id);
        }
        for id in self.pending.expired(now, self.config.ack_timeout_ms) {
            self.retry(id);
        }
    }

    /// Longest time an entry may stay pending after its first transmission
    fn lifetime(&self) -> u64 {
        self.config
            .ack_timeout_ms
            .saturating_mul(u64::from(self.config.max_retries) + 1)
    }

    /// Queue a retransmission of pending `id`, or fail it once its retries
    /// are spent
    fn retry(&mut self, id: u16) {
        let Some(entry) = self.pending.get(id) else {
            return;
        };
        if entry.requeued {
            return;
        }
        if entry.retry_count() >= self.config.max_retries {
            self.give_up(id);
            return;
        }
        if self.outbound.is_full() {
            debug!("outbound queue full, retry of packet {} deferred", id);
            return;
        }

        let Some(entry) = self.pending.get_mut(id) else {
            return;
        };
        let attempt = entry.packet.increment_retry();
        entry.requeued = true;
        let copy = entry.packet.clone();
        self.stats.retransmissions = self.stats.retransmissions.wrapping_add(1);
        debug!("resending packet {} (retry {})", id, attempt);
        self.outbound.write(copy);
    }

    fn give_up(&mut self, id: u16) {
        if let Some(entry) = self.pending.remove(id) {
            let kind = Header::read(&entry.packet)
                .map(|header| header.kind)
                .unwrap_or(PacketType::Unknown(0));
            self.fail_delivery(id, kind);
        }
    }

    fn fail_delivery(&mut self, id: u16, kind: PacketType) {
        self.stats.delivery_failures = self.stats.delivery_failures.wrapping_add(1);
        warn!("delivery of packet {} ({:?}) failed", id, kind);
        self.push_event(LinkEvent::DeliveryFailed { id, kind });
    }

    fn push_event(&mut self, event: LinkEvent) {
        if self.events.write(event).is_some() {
            self.stats.event_overflows = self.stats.event_overflows.wrapping_add(1);
        }
    }

    /// Next id for an outbound packet.
    ///
    /// Cycles through `1..ID_WRAP`, skipping ids that are still pending.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_id;
            self.next_id = if id + 1 >= ID_WRAP { 1 } else { id + 1 };
            // Terminates: the table holds far fewer ids than the cycle
            if !self.pending.contains(id) {
                return id;
            }
        }
    }

    /// Queue this side's [`LinkStats`] as a `Debug` packet for the peer
    pub fn enqueue_stats_report(&mut self, now: u64) -> Result<u16, LinkError> {
        let mut buf = [0u8; MAX_ENCODED];
        let stats = self.stats();
        let len = stats.encode_report(&mut buf).map_err(|_| LinkError::Encode)?.len();
        self.send(PacketType::Debug, &buf[..len], now)
    }

    /// The last stats report received from the peer
    pub fn peer_stats(&self) -> Option<LinkStats> {
        self.peer_stats
    }

    // ---- application side ----

    pub fn try_dequeue(&mut self, selector: QueueSelector) -> Option<PacketBuffer> {
        match selector {
            QueueSelector::General => self.general.read(),
            other => self.routes.get_mut(&other)?.read(),
        }
    }

    /// Packets waiting in a queue; zero for unregistered selectors
    pub fn queue_len(&self, selector: QueueSelector) -> usize {
        match selector {
            QueueSelector::General => self.general.unread(),
            other => self.routes.get(&other).map_or(0, |queue| queue.unread()),
        }
    }

    pub fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.read()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: u16) -> bool {
        self.pending.contains(id)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.unread()
    }

    /// Nothing queued, framed or in flight
    pub fn tx_idle(&self) -> bool {
        self.outbound.is_empty() && self.encoder.is_idle()
    }

    pub fn rx_state(&self) -> RxState {
        self.decoder.state()
    }

    pub fn tx_status(&self) -> TxStatus {
        self.tx_status
    }

    /// Session counters merged with the decoder's
    pub fn stats(&self) -> LinkStats {
        let decoder = self.decoder.stats();
        let mut stats = self.stats;
        stats.framing_errors = decoder.framing_errors;
        stats.misaligned_bytes = decoder.misaligned_bytes;
        stats.rx_queue_overflows = stats
            .rx_queue_overflows
            .wrapping_add(decoder.completed_overflows);
        stats
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_ring::ByteRing;
    use crate::framing::encode_frame;
    use crate::header::{START_MARKER, NO_ID};
    use crate::traits::PortError;

    const T: u64 = 1_000;

    #[derive(Default)]
    struct MockPort {
        wire: Vec<u8>,
        done: bool,
    }

    impl SerialPort for MockPort {
        fn begin_transmit(&mut self, bytes: &[u8]) -> Result<(), PortError> {
            self.wire.extend_from_slice(bytes);
            self.done = true;
            Ok(())
        }

        fn poll_complete(&mut self) -> bool {
            core::mem::replace(&mut self.done, false)
        }
    }

    type TestSession = Session<MockPort, 1024>;

    fn config() -> LinkConfig {
        LinkConfig {
            ack_timeout_ms: T,
            tx_chunk_size: 1024,
            ..LinkConfig::default()
        }
    }

    fn session() -> TestSession {
        Session::new(MockPort::default(), config())
    }

    fn wire(packet: &PacketBuffer) -> Vec<u8> {
        let mut out = vec![START_MARKER];
        encode_frame(packet.as_bytes(), &mut out);
        out
    }

    /// Decode everything the session has written to the port so far
    fn sent(session: &mut TestSession) -> Vec<PacketBuffer> {
        let bytes = core::mem::take(&mut session.port_mut().wire);
        let mut decoder = FrameDecoder::new(4096, u64::MAX, 64);
        decoder.feed_slice(&bytes, 0);
        core::iter::from_fn(|| decoder.pop()).collect()
    }

    fn kind_of(packet: &PacketBuffer) -> PacketType {
        Header::read(packet).unwrap().kind
    }

    #[test]
    fn test_ack_within_timeout_clears_pending() {
        let mut session = session();
        let id = session.send(PacketType::Command, &[1], 0).unwrap();
        session.poll_tx(0);
        assert!(session.is_pending(id));
        assert_eq!(session.tx_status(), TxStatus::Sent);

        let ack = build_ack(PacketType::Ok, 77, id, 0).unwrap();
        assert_eq!(session.receive_bytes(&wire(&ack), T / 2), 1);

        assert!(!session.is_pending(id));
        assert_eq!(session.next_event(), Some(LinkEvent::Delivered { id }));
        assert_eq!(session.stats().retransmissions, 0);
        assert_eq!(session.stats().acks_received, 1);
    }

    #[test]
    fn test_unanswered_packet_fails_after_max_retries() {
        let mut session = session();
        let id = session.send(PacketType::Command, &[1], 0).unwrap();
        session.poll_tx(0);
        for tick in 1..=4 {
            session.poll_tx(tick * T);
        }

        assert_eq!(
            session.next_event(),
            Some(LinkEvent::DeliveryFailed { id, kind: PacketType::Command })
        );
        assert_eq!(session.next_event(), None);
        assert!(!session.is_pending(id));

        let stats = session.stats();
        assert_eq!(stats.retransmissions, 3);
        assert_eq!(stats.delivery_failures, 1);

        let frames = sent(&mut session);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|p| Header::read(p).unwrap().id == id));

        // Nothing survives further ticks
        session.poll_tx(10 * T);
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.next_event(), None);
    }

    #[test]
    fn test_nack_resends_immediately() {
        let mut session = session();
        let id = session.send(PacketType::Setting, &[2, 9], 0).unwrap();
        session.poll_tx(0);
        sent(&mut session);

        let nack = build_ack(PacketType::Error, 5, id, 0).unwrap();
        session.receive_bytes(&wire(&nack), 10);
        // Still tracked while the copy waits to go out
        assert!(session.is_pending(id));
        assert_eq!(session.outbound_len(), 1);

        session.poll_tx(10);
        let frames = sent(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(Header::read(&frames[0]).unwrap().id, id);
        assert!(session.is_pending(id));
        assert_eq!(session.stats().retransmissions, 1);
    }

    #[test]
    fn test_busy_rearms_timeout() {
        let mut session = session();
        let id = session.send(PacketType::Message, &[1, b'x'], 0).unwrap();
        session.poll_tx(0);

        let busy = build_ack(PacketType::Busy, 5, id, 0).unwrap();
        session.receive_bytes(&wire(&busy), T - 1);
        session.poll_tx(T);

        assert!(session.is_pending(id));
        assert_eq!(session.stats().retransmissions, 0);
        assert_eq!(session.stats().busy_received, 1);
    }

    #[test]
    fn test_unmatched_ack_is_counted() {
        let mut session = session();
        let ack = build_ack(PacketType::Ok, 1, 4242, 0).unwrap();
        session.receive_bytes(&wire(&ack), 0);
        assert_eq!(session.stats().unmatched_acks, 1);
        assert!(!session.has_events());
    }

    #[test]
    fn test_command_is_acked_and_routed() {
        let mut session = session();
        session.register_queue(CommandType::Ssids.into()).unwrap();

        let command = build_packet(PacketType::Command, 300, &[CommandType::Ssids as u8], 0).unwrap();
        session.receive_bytes(&wire(&command), 0);
        assert_eq!(session.try_dequeue(CommandType::Ssids.into()), Some(command));

        session.poll_tx(0);
        let frames = sent(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(kind_of(&frames[0]), PacketType::Ok);
        assert_eq!(header::acked_id(&frames[0]), Some(300));
        // Acks are fire-and-forget
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn test_sub_type_queues_keep_fifo_order() {
        let mut session = session();
        session.register_queue(CommandType::WifiStatus.into()).unwrap();
        session.register_queue(MessageType::Ascii.into()).unwrap();

        let c1 = build_packet(PacketType::Command, 1, &[3, 0xA], 0).unwrap();
        let m1 = build_packet(PacketType::Message, 2, &[1, 0xB], 0).unwrap();
        let c2 = build_packet(PacketType::Command, 3, &[3, 0xC], 0).unwrap();
        let m2 = build_packet(PacketType::Message, 4, &[1, 0xD], 0).unwrap();
        let other = build_packet(PacketType::Command, 5, &[2, 0xE], 0).unwrap();

        let mut bytes = Vec::new();
        for packet in [&c1, &m1, &c2, &other, &m2] {
            bytes.extend(wire(packet));
        }
        assert_eq!(session.receive_bytes(&bytes, 0), 5);

        let commands = QueueSelector::Command(3);
        let messages = QueueSelector::Message(1);
        assert_eq!(session.queue_len(commands), 2);
        assert_eq!(session.try_dequeue(commands), Some(c1));
        assert_eq!(session.try_dequeue(commands), Some(c2));
        assert_eq!(session.try_dequeue(messages), Some(m1));
        assert_eq!(session.try_dequeue(messages), Some(m2));
        // Unregistered sub-type falls back to the general queue
        assert_eq!(session.try_dequeue(QueueSelector::General), Some(other));
        assert_eq!(session.try_dequeue(QueueSelector::Command(2)), None);
    }

    #[test]
    fn test_outbound_queue_is_bounded() {
        let mut session: TestSession = Session::new(
            MockPort::default(),
            LinkConfig { outbound_capacity: 4, ..config() },
        );
        let mut rejected = 0;
        for i in 0..10u8 {
            if session.send(PacketType::Message, &[1, i], 0) == Err(LinkError::OutboundFull) {
                rejected += 1;
            }
            assert!(session.outbound_len() <= 4);
        }
        assert_eq!(rejected, 6);
        assert_eq!(session.stats().outbound_overflows, 6);
    }

    #[test]
    fn test_malformed_packets_never_reach_queues() {
        let mut session = session();
        let mut packet = build_packet(PacketType::Message, 1, &[1, 2, 3], 0).unwrap();
        packet.append(4, 1).unwrap();

        assert!(!session.loopback(packet.clone(), 0));
        assert_eq!(session.queue_len(QueueSelector::General), 0);
        assert_eq!(session.stats().malformed_packets, 1);
        assert_eq!(
            session.enqueue_outbound(packet),
            Err(LinkError::Packet(PacketError::LengthMismatch))
        );
    }

    #[test]
    fn test_loopback_does_not_ack() {
        let mut session = session();
        let message = build_packet(PacketType::Message, 8, &[1, b'h', b'i'], 0).unwrap();
        assert!(session.loopback(message.clone(), 0));
        assert_eq!(session.try_dequeue(QueueSelector::General), Some(message));
        assert_eq!(session.outbound_len(), 0);
    }

    #[test]
    fn test_debug_packets_are_not_queued() {
        let mut session = session();
        let debug = build_packet(PacketType::Debug, 4, b"hello", 0).unwrap();
        let local = build_packet(PacketType::LocalDebug, NO_ID, b"local", 0).unwrap();
        session.receive_bytes(&wire(&debug), 0);
        session.receive_bytes(&wire(&local), 0);

        assert_eq!(session.queue_len(QueueSelector::General), 0);
        assert_eq!(session.stats().debug_discarded, 2);
        // Only the peer's Debug packet is acknowledged
        assert_eq!(session.outbound_len(), 1);
    }

    #[test]
    fn test_unknown_type_goes_to_general_queue() {
        let mut session = session();
        let odd = build_packet(PacketType::Unknown(42), 9, &[1], 0).unwrap();
        session.receive_bytes(&wire(&odd), 0);
        assert_eq!(session.try_dequeue(QueueSelector::General), Some(odd));
        assert_eq!(session.outbound_len(), 1);
    }

    #[test]
    fn test_packet_ids_wrap_and_skip_pending() {
        let mut session = session();
        assert_eq!(session.next_packet_id(), 1);

        session.next_id = ID_WRAP - 1;
        assert_eq!(session.next_packet_id(), ID_WRAP - 1);
        assert_eq!(session.next_packet_id(), 1);

        let packet = build_packet(PacketType::Command, 2, &[1], 0).unwrap();
        session.pending.insert(2, packet).unwrap();
        assert_eq!(session.next_packet_id(), 3);
    }

    #[test]
    fn test_full_pending_table_holds_back_packets() {
        let mut session: TestSession = Session::new(
            MockPort::default(),
            LinkConfig { outbound_capacity: 40, ..config() },
        );
        for _ in 0..=crate::pending::MAX_PENDING {
            session.send(PacketType::Command, &[1], 0).unwrap();
        }
        session.poll_tx(0);
        assert_eq!(session.pending_len(), crate::pending::MAX_PENDING);
        assert_eq!(session.outbound_len(), 1);
        assert_eq!(session.tx_status(), TxStatus::Waiting);
    }

    #[test]
    fn test_poll_reads_from_ring() {
        let mut session = session();
        let mut ring: ByteRing<64> = ByteRing::new();
        let (mut producer, mut consumer) = ring.split();

        let message = build_packet(PacketType::Message, 11, &[1, 0xC0, 0xDB], 0).unwrap();
        producer.write(&wire(&message)).unwrap();
        assert_eq!(session.poll(&mut consumer, 0), 1);
        assert_eq!(session.rx_state(), RxState::WaitStart);
        assert_eq!(session.try_dequeue(QueueSelector::Message(1)), None);
        assert_eq!(session.try_dequeue(QueueSelector::General), Some(message));

        // The ack went out during the same poll
        let frames = sent(&mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(header::acked_id(&frames[0]), Some(11));
    }

    #[test]
    fn test_stats_report_round_trip() {
        let mut session = session();
        session.receive_bytes(&[0x01, 0x02], 0);
        let id = session.enqueue_stats_report(0).unwrap();
        session.poll_tx(0);

        let frames = sent(&mut session);
        let header = Header::read(&frames[0]).unwrap();
        assert_eq!((header.kind, header.id), (PacketType::Debug, id));
        let payload = frames[0].bytes(PAYLOAD_OFFSET, usize::from(header.length)).unwrap();
        let stats = LinkStats::decode_report(payload).unwrap();
        assert_eq!(stats.misaligned_bytes, 2);

        // The peer records the report instead of queuing it
        let mut peer: TestSession = Session::new(MockPort::default(), config());
        assert_eq!(peer.peer_stats(), None);
        peer.receive_bytes(&wire(&frames[0]), 0);
        assert_eq!(peer.peer_stats(), Some(stats));
        assert_eq!(peer.queue_len(QueueSelector::General), 0);
    }

    #[test]
    fn test_text_debug_is_not_a_stats_report() {
        let mut session = session();
        let debug = build_packet(PacketType::Debug, 4, b"heap low: 12345678 bytes", 0).unwrap();
        session.receive_bytes(&wire(&debug), 0);
        assert_eq!(session.peer_stats(), None);
        assert_eq!(session.stats().debug_discarded, 1);
    }

    /// Accepts one chunk and never reports it finished
    #[derive(Default)]
    struct StuckPort {
        started: usize,
    }

    impl SerialPort for StuckPort {
        fn begin_transmit(&mut self, _bytes: &[u8]) -> Result<(), PortError> {
            self.started += 1;
            Ok(())
        }

        fn poll_complete(&mut self) -> bool {
            false
        }
    }

    fn events<P: SerialPort, const TX: usize>(session: &mut Session<P, TX>) -> Vec<LinkEvent> {
        core::iter::from_fn(|| session.next_event()).collect()
    }

    #[test]
    fn test_deferred_retries_still_fail_on_stuck_port() {
        let mut session: Session<StuckPort, 64> = Session::new(
            StuckPort::default(),
            LinkConfig { outbound_capacity: 4, ..config() },
        );
        let id = session.send(PacketType::Command, &[1], 0).unwrap();
        session.poll_tx(0);
        assert!(session.is_pending(id));

        let mut failed_at = None;
        for tick in 1..=10 {
            while session.send(PacketType::Message, &[1, 0x55], tick * T).is_ok() {}
            session.poll_tx(tick * T);
            if !session.is_pending(id) {
                failed_at = Some(tick);
                break;
            }
        }

        assert_eq!(failed_at, Some(4));
        assert!(events(&mut session)
            .contains(&LinkEvent::DeliveryFailed { id, kind: PacketType::Command }));
        assert_eq!(session.port().started, 1);
    }

    #[test]
    fn test_endless_busy_replies_do_not_keep_packet_alive() {
        let mut session = session();
        let id = session.send(PacketType::Message, &[1, b'x'], 0).unwrap();
        session.poll_tx(0);

        for tick in 1..=4 {
            let busy = build_ack(PacketType::Busy, 5, id, 0).unwrap();
            session.receive_bytes(&wire(&busy), tick * T - 1);
            session.poll_tx(tick * T);
        }

        assert!(!session.is_pending(id));
        assert_eq!(
            events(&mut session),
            vec![LinkEvent::DeliveryFailed { id, kind: PacketType::Message }]
        );
        assert_eq!(session.stats().retransmissions, 0);
        assert_eq!(session.stats().busy_received, 4);
    }

    #[test]
    fn test_nack_after_last_retry_fails_delivery() {
        let mut session: TestSession = Session::new(
            MockPort::default(),
            LinkConfig { max_retries: 1, ..config() },
        );
        let id = session.send(PacketType::Setting, &[3, 1], 0).unwrap();
        session.poll_tx(0);

        let nack = build_ack(PacketType::Error, 5, id, 0).unwrap();
        session.receive_bytes(&wire(&nack), 10);
        session.poll_tx(10);
        assert!(session.is_pending(id));
        assert_eq!(session.stats().retransmissions, 1);

        session.receive_bytes(&wire(&nack), 20);
        assert!(!session.is_pending(id));
        assert_eq!(
            session.next_event(),
            Some(LinkEvent::DeliveryFailed { id, kind: PacketType::Setting })
        );
        assert_eq!(session.stats().nacks_received, 2);
        assert_eq!(session.stats().delivery_failures, 1);
    }

    #[test]
    fn test_nack_with_full_outbound_keeps_entry_pending() {
        let mut session: TestSession = Session::new(
            MockPort::default(),
            LinkConfig { outbound_capacity: 2, ..config() },
        );
        let id = session.send(PacketType::Command, &[1], 0).unwrap();
        session.poll_tx(0);
        session.send(PacketType::Message, &[1, 1], 0).unwrap();
        session.send(PacketType::Message, &[1, 2], 0).unwrap();

        let nack = build_ack(PacketType::Error, 5, id, 0).unwrap();
        session.receive_bytes(&wire(&nack), 10);

        assert!(session.is_pending(id));
        assert_eq!(session.outbound_len(), 2);
        assert_eq!(session.stats().retransmissions, 0);
        assert!(!session.has_events());
    }

    #[test]
    fn test_packet_larger_than_tx_ring_is_dropped() {
        let mut session: Session<MockPort, 64> = Session::new(MockPort::default(), config());
        let id = session.send(PacketType::Command, &[1; 100], 0).unwrap();
        assert_eq!(session.poll_tx(0), 0);

        assert_eq!(session.outbound_len(), 0);
        assert!(!session.is_pending(id));
        assert_eq!(
            session.next_event(),
            Some(LinkEvent::DeliveryFailed { id, kind: PacketType::Command })
        );
        assert_eq!(session.stats().packets_sent, 0);
    }

    #[test]
    fn test_acked_packet_drops_queued_retransmission() {
        let mut session = session();
        let id = session.send(PacketType::Command, &[1], 0).unwrap();
        session.poll_tx(0);
        sent(&mut session);

        let nack = build_ack(PacketType::Error, 5, id, 0).unwrap();
        let ack = build_ack(PacketType::Ok, 6, id, 0).unwrap();
        let mut bytes = wire(&nack);
        bytes.extend(wire(&ack));
        // The ack lands before the retransmission is framed
        session.receive_bytes(&bytes, 10);
        assert_eq!(session.outbound_len(), 1);
        assert!(!session.is_pending(id));

        session.poll_tx(10);
        assert!(sent(&mut session).is_empty());
        assert_eq!(session.outbound_len(), 0);
        assert_eq!(session.next_event(), Some(LinkEvent::Delivered { id }));
    }

    #[test]
    fn test_stalled_frame_is_dropped_on_next_receive() {
        let mut session = session();
        session.receive_bytes(&[START_MARKER, 8, 1], 0);
        assert_eq!(session.rx_state(), RxState::WaitHeader);
        session.receive_bytes(&[], 5_000);
        assert_eq!(session.rx_state(), RxState::WaitStart);
        assert_eq!(session.stats().framing_errors, 1);
    }
}
