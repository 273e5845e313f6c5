use crate::packet::PacketType;

/// A single radio packet could not be decoded. The packet is discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("packet too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("packet crc mismatch (expected {expected:#04x}, got {actual:#04x})")]
    CrcMismatch { expected: u8, actual: u8 },

    #[error("unknown packet type bits {0:#05b}")]
    UnknownType(u8),

    /// `address2` must repeat the sender address or be zero.
    #[error("address mismatch in packet ({address:#010x} vs {address2:#010x})")]
    AddressMismatch { address: u32, address2: u32 },

    #[error("bad length {len} for {packet_type} packet")]
    BadLength { packet_type: PacketType, len: usize },
}

/// Message-level decode or sequencing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("unexpected packet type (expected {expected}, got {actual})")]
    UnexpectedPacketType {
        expected: PacketType,
        actual: PacketType,
    },

    #[error("unexpected packet sequence (expected {expected}, got {actual})")]
    UnexpectedSequence { expected: u8, actual: u8 },

    #[error("message crc mismatch (expected {expected:#06x}, got {actual:#06x})")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("message data exceeds announced length ({received} > {declared})")]
    LengthOverflow { declared: usize, received: usize },

    #[error("malformed message part at offset {offset}")]
    MalformedPart { offset: usize },

    #[error("message body too long ({len} bytes, max {max})")]
    MessageTooLong { len: usize, max: usize },

    /// A part's nonce and payload must fit its one-byte length field.
    #[error("message part {part_type:#04x} too long ({len} bytes, max 255)")]
    PartTooLong { part_type: u8, len: usize },

    #[error("message already complete")]
    AlreadyComplete,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
