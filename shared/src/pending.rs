//! Pending-acknowledgment table.
//!
//! Holds every transmitted packet whose type requires an acknowledgment,
//! keyed by packet id. At most one entry exists per id. The packet itself
//! carries `sent_at` (its timestamp, refreshed on every transmission) and the
//! retry count. The entry remembers when the packet first went out, which
//! bounds its total lifetime regardless of retries, deferrals or `Busy`
//! replies.
//!
//! An entry stays in the table while a retransmission of it waits in the
//! outbound queue; `requeued` marks that state.

use heapless::LinearMap;

use crate::packet::PacketBuffer;

/// Upper bound on unacknowledged packets in flight
pub const MAX_PENDING: usize = 32;

/// A sent packet awaiting its acknowledgment
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: u16,
    pub packet: PacketBuffer,
    /// Time of the first transmission
    pub first_sent: u64,
    /// A copy is queued for retransmission
    pub requeued: bool,
}

impl PendingEntry {
    pub fn new(id: u16, packet: PacketBuffer) -> Self {
        Self {
            id,
            first_sent: packet.created_at(),
            packet,
            requeued: false,
        }
    }

    #[inline]
    pub fn sent_at(&self) -> u64 {
        self.packet.created_at()
    }

    #[inline]
    pub fn retry_count(&self) -> u8 {
        self.packet.retry_count()
    }

    pub fn into_packet(self) -> PacketBuffer {
        self.packet
    }
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: LinearMap<u16, PendingEntry, MAX_PENDING>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: LinearMap::new(),
        }
    }

    /// Track `packet` under `id`.
    ///
    /// Replaces and returns an existing entry for the same id. When the table
    /// is full the packet is handed back in `Err`.
    pub fn insert(&mut self, id: u16, packet: PacketBuffer) -> Result<Option<PendingEntry>, PacketBuffer> {
        self.entries
            .insert(id, PendingEntry::new(id, packet))
            .map_err(|(_, entry)| entry.into_packet())
    }

    pub fn remove(&mut self, id: u16) -> Option<PendingEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&PendingEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut PendingEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_PENDING
    }

    /// Ids whose last transmission is at least `timeout` old, oldest first.
    ///
    /// Entries with a retransmission already queued are skipped.
    pub fn expired(&self, now: u64, timeout: u64) -> heapless::Vec<u16, MAX_PENDING> {
        let mut aged: heapless::Vec<(u64, u16), MAX_PENDING> = self
            .entries
            .values()
            .filter(|entry| !entry.requeued && now.saturating_sub(entry.sent_at()) >= timeout)
            .map(|entry| (entry.sent_at(), entry.id))
            .collect();
        aged.sort_unstable();
        aged.iter().map(|&(_, id)| id).collect()
    }

    /// Ids first sent at least `lifetime` ago, oldest first
    pub fn outlived(&self, now: u64, lifetime: u64) -> heapless::Vec<u16, MAX_PENDING> {
        let mut aged: heapless::Vec<(u64, u16), MAX_PENDING> = self
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.first_sent) >= lifetime)
            .map(|entry| (entry.first_sent, entry.id))
            .collect();
        aged.sort_unstable();
        aged.iter().map(|&(_, id)| id).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
