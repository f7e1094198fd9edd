//! Wire header layout and packet builders.
//!
//! ```text
//!  wire:    0xFF │ type │ id (LE) │ length (LE) │ payload[length] │  escaped, 0xC0 terminated
//!  buffer:       │  0   │  1..3   │    3..5     │     5..         │
//! ```
//!
//! The start marker exists only on the wire; a [`PacketBuffer`] always
//! begins with the 5-byte header.

use crate::packet::{PacketBuffer, PacketError};

/// First byte of every frame on the wire
pub const START_MARKER: u8 = 0xFF;

pub const HEADER_SIZE: usize = 5;
pub const TYPE_OFFSET: usize = 0;
pub const ID_OFFSET: usize = 1;
pub const LENGTH_OFFSET: usize = 3;
pub const PAYLOAD_OFFSET: usize = 5;

/// Never assigned to an outbound packet
pub const RESERVED_ID: u16 = 0;
/// Marks a packet that carries no meaningful id
pub const NO_ID: u16 = 0xFFFF;
/// The id counter restarts at 1 when it reaches this value
pub const ID_WRAP: u16 = 0xFFFE;

/// Payload length of `Ok`/`Error`/`Busy` replies: the referenced id
pub const ACK_PAYLOAD_LEN: u16 = 2;

/// First-level packet tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    /// Positive acknowledgment
    Ok,
    /// Negative acknowledgment (Nack)
    Error,
    /// Receiver cannot take the packet right now
    Busy,
    /// Debug text for the peer's log
    Debug,
    /// Debug text that never leaves the local chip
    LocalDebug,
    Message,
    Setting,
    Command,
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            1 => PacketType::Ok,
            2 => PacketType::Error,
            3 => PacketType::Busy,
            4 => PacketType::Debug,
            5 => PacketType::LocalDebug,
            6 => PacketType::Message,
            7 => PacketType::Setting,
            8 => PacketType::Command,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(kind: PacketType) -> Self {
        match kind {
            PacketType::Ok => 1,
            PacketType::Error => 2,
            PacketType::Busy => 3,
            PacketType::Debug => 4,
            PacketType::LocalDebug => 5,
            PacketType::Message => 6,
            PacketType::Setting => 7,
            PacketType::Command => 8,
            PacketType::Unknown(other) => other,
        }
    }
}

impl PacketType {
    /// Whether the sender keeps the packet pending until the peer acks it
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            PacketType::Debug
                | PacketType::Message
                | PacketType::Setting
                | PacketType::Command
                | PacketType::Unknown(_)
        )
    }

    /// `Ok`, `Error` and `Busy` reference another packet's id
    pub fn is_ack_reply(self) -> bool {
        matches!(self, PacketType::Ok | PacketType::Error | PacketType::Busy)
    }

    /// Whether the payload starts with a sub-type byte
    pub fn has_sub_type(self) -> bool {
        matches!(
            self,
            PacketType::Message | PacketType::Setting | PacketType::Command
        )
    }
}

/// Second-level tag of `Command` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CommandType {
    Ssids = 1,
    ConnectToSsid = 2,
    WifiStatus = 3,
    RoomList = 4,
    RoomJoin = 5,
    RoomLeave = 6,
}

impl TryFrom<u8> for CommandType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandType::Ssids),
            2 => Ok(CommandType::ConnectToSsid),
            3 => Ok(CommandType::WifiStatus),
            4 => Ok(CommandType::RoomList),
            5 => Ok(CommandType::RoomJoin),
            6 => Ok(CommandType::RoomLeave),
            other => Err(other),
        }
    }
}

/// Second-level tag of `Message` packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageType {
    Ascii = 1,
    Watch = 2,
    Unwatch = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Ascii),
            2 => Ok(MessageType::Watch),
            3 => Ok(MessageType::Unwatch),
            other => Err(other),
        }
    }
}

/// Decoded fixed-size header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub kind: PacketType,
    pub id: u16,
    /// Payload length, header excluded
    pub length: u16,
}

impl Header {
    pub fn new(kind: PacketType, id: u16, length: u16) -> Self {
        Self { kind, id, length }
    }

    /// Parse the header at the start of `packet`
    pub fn read(packet: &PacketBuffer) -> Result<Self, PacketError> {
        if packet.len() < HEADER_SIZE {
            return Err(PacketError::Truncated);
        }
        Ok(Self {
            kind: PacketType::from(packet.read::<u8>(TYPE_OFFSET)?),
            id: packet.read::<u16>(ID_OFFSET)?,
            length: packet.read::<u16>(LENGTH_OFFSET)?,
        })
    }

    pub fn write(&self, packet: &mut PacketBuffer) -> Result<(), PacketError> {
        packet.put::<u8>(TYPE_OFFSET, self.kind.into())?;
        packet.put::<u16>(ID_OFFSET, self.id)?;
        packet.put::<u16>(LENGTH_OFFSET, self.length)
    }

    /// Header plus payload size in bytes
    pub fn packet_len(&self) -> usize {
        HEADER_SIZE + usize::from(self.length)
    }
}

/// Build a complete packet from a payload
pub fn build_packet(
    kind: PacketType,
    id: u16,
    payload: &[u8],
    now: u64,
) -> Result<PacketBuffer, PacketError> {
    let length = u16::try_from(payload.len()).map_err(|_| PacketError::TooLarge)?;
    let mut packet = PacketBuffer::with_capacity(now, HEADER_SIZE + payload.len())?;
    Header::new(kind, id, length).write(&mut packet)?;
    packet.set_bytes(PAYLOAD_OFFSET, payload)?;
    Ok(packet)
}

/// Build an `Ok`/`Error`/`Busy` reply referencing `acked_id`
pub fn build_ack(
    kind: PacketType,
    id: u16,
    acked_id: u16,
    now: u64,
) -> Result<PacketBuffer, PacketError> {
    build_packet(kind, id, &acked_id.to_le_bytes(), now)
}

/// Rewrite the length field from the bytes actually written.
///
/// For packets assembled field by field with `append`.
pub fn finalize_length(packet: &mut PacketBuffer) -> Result<u16, PacketError> {
    let payload = packet
        .len()
        .checked_sub(HEADER_SIZE)
        .ok_or(PacketError::Truncated)?;
    let length = u16::try_from(payload).map_err(|_| PacketError::TooLarge)?;
    packet.put::<u16>(LENGTH_OFFSET, length)?;
    Ok(length)
}

/// First payload byte, if the packet has one
pub fn sub_type(packet: &PacketBuffer) -> Option<u8> {
    if packet.len() > PAYLOAD_OFFSET {
        packet.read::<u8>(PAYLOAD_OFFSET).ok()
    } else {
        None
    }
}

/// The id referenced by an acknowledgment reply
pub fn acked_id(packet: &PacketBuffer) -> Option<u16> {
    if packet.len() >= PAYLOAD_OFFSET + usize::from(ACK_PAYLOAD_LEN) {
        packet.read::<u16>(PAYLOAD_OFFSET).ok()
    } else {
        None
    }
}

/// Check that the length field agrees with the bytes present
pub fn validate(packet: &PacketBuffer) -> Result<Header, PacketError> {
    let header = Header::read(packet)?;
    if header.packet_len() != packet.len() {
        return Err(PacketError::LengthMismatch);
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_round_trip() {
        for byte in 0..=u8::MAX {
            assert_eq!(u8::from(PacketType::from(byte)), byte);
        }
        assert_eq!(PacketType::from(8), PacketType::Command);
        assert_eq!(PacketType::from(42), PacketType::Unknown(42));
    }

    #[test]
    fn test_requires_ack() {
        assert!(PacketType::Command.requires_ack());
        assert!(PacketType::Debug.requires_ack());
        assert!(PacketType::Unknown(99).requires_ack());
        assert!(!PacketType::Ok.requires_ack());
        assert!(!PacketType::Busy.requires_ack());
        assert!(!PacketType::LocalDebug.requires_ack());
    }

    #[test]
    fn test_build_packet_layout() {
        let packet = build_packet(PacketType::Command, 0x0102, &[3, 9], 0).unwrap();
        assert_eq!(packet.as_bytes(), &[8, 0x02, 0x01, 2, 0, 3, 9]);

        let header = validate(&packet).unwrap();
        assert_eq!(header, Header::new(PacketType::Command, 0x0102, 2));
        assert_eq!(sub_type(&packet), Some(3));
    }

    #[test]
    fn test_build_ack() {
        let ack = build_ack(PacketType::Ok, 7, 0x1234, 0).unwrap();
        assert_eq!(Header::read(&ack).unwrap().length, ACK_PAYLOAD_LEN);
        assert_eq!(acked_id(&ack), Some(0x1234));
    }

    #[test]
    fn test_finalize_length() {
        let mut packet = PacketBuffer::new(0);
        Header::new(PacketType::Message, 4, 0).write(&mut packet).unwrap();
        packet.append(MessageType::Ascii as u64, 1).unwrap();
        packet.append_bytes(b"hello").unwrap();
        assert_eq!(validate(&packet), Err(PacketError::LengthMismatch));

        assert_eq!(finalize_length(&mut packet), Ok(6));
        assert!(validate(&packet).is_ok());
    }

    #[test]
    fn test_validate_rejects_short_packets() {
        let packet = PacketBuffer::from_bytes(0, &[8, 1, 0]).unwrap();
        assert_eq!(validate(&packet), Err(PacketError::Truncated));
        assert_eq!(sub_type(&packet), None);
        assert_eq!(acked_id(&packet), None);
    }

    #[test]
    fn test_sub_type_enums() {
        assert_eq!(CommandType::try_from(2), Ok(CommandType::ConnectToSsid));
        assert_eq!(CommandType::try_from(5), Ok(CommandType::RoomJoin));
        assert_eq!(MessageType::try_from(3), Ok(MessageType::Unwatch));
        assert_eq!(MessageType::try_from(0), Err(0));
    }
}
