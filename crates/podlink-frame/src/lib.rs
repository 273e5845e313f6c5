//! Radio packet and message framing.
//!
//! Two framing layers sit on top of the raw adapter bytes:
//! - [`RadioPacket`]: one transmission. 4-byte address, a type/sequence byte,
//!   up to 31 body bytes and a CRC-8 trailer.
//! - [`PdmMessage`] / [`PodMessage`]: one logical request or response. A
//!   6-byte header, a list of type/length-prefixed parts and a CRC-16,
//!   fragmented across as many radio packets as needed.
//!
//! Both checksums are exposed from [`crc`].

pub mod crc;
pub mod error;
pub mod message;
pub mod packet;

pub use crc::{crc16, crc16_table, crc8};
pub use error::{FramingError, ProtocolError, Result};
pub use message::{
    MessagePart, PdmMessage, PodMessage, BAD_NONCE_CODE, ERROR_RESPONSE_TYPE, MAX_MESSAGE_BODY,
    MESSAGE_HEADER_LEN, STATUS_RESPONSE_TYPE,
};
pub use packet::{PacketType, RadioPacket, MAX_PACKET_BODY, MIN_PACKET_LEN};
