use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::crc8;
use crate::error::FramingError;

/// Address (4) + type/sequence (1).
pub const PACKET_HEADER_LEN: usize = 5;

/// Smallest buffer that can hold a packet: header only, no CRC check possible
/// below this.
pub const MIN_PACKET_LEN: usize = 5;

/// Maximum bytes carried after the type/sequence byte.
pub const MAX_PACKET_BODY: usize = 31;

const ADDRESS2_LEN: usize = 4;
const SEQUENCE_MASK: u8 = 0x1f;

/// Radio packet type, encoded in the top three bits of byte 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Ack,
    Con,
    Pdm,
    Pod,
}

impl PacketType {
    pub const fn bits(self) -> u8 {
        match self {
            PacketType::Ack => 0b010,
            PacketType::Con => 0b100,
            PacketType::Pdm => 0b101,
            PacketType::Pod => 0b111,
        }
    }

    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b010 => Some(PacketType::Ack),
            0b100 => Some(PacketType::Con),
            0b101 => Some(PacketType::Pdm),
            0b111 => Some(PacketType::Pod),
            _ => None,
        }
    }

    /// Whether packets of this type carry a second address word.
    pub const fn has_address2(self) -> bool {
        !matches!(self, PacketType::Con)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Ack => "ACK",
            PacketType::Con => "CON",
            PacketType::Pdm => "PDM",
            PacketType::Pod => "POD",
        };
        f.write_str(name)
    }
}

/// One radio transmission.
///
/// Wire format:
/// ```text
/// ┌──────────────┬────────────────┬──────────────────┬───────────┬─────────┐
/// │ Address (4B) │ Type<<5 | Seq  │ Address2 (4B)    │ Body      │ CRC-8   │
/// │ big endian   │ (1B)           │ ACK/PDM/POD only │ (≤ 31B)   │ (1B)    │
/// └──────────────┴────────────────┴──────────────────┴───────────┴─────────┘
/// ```
///
/// `address2 == address` means the sender keeps the conversation going,
/// `address2 == 0` closes it. For PDM/POD packets `address2` doubles as the
/// message address at the start of the message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioPacket {
    pub address: u32,
    pub packet_type: PacketType,
    /// 5-bit packet sequence.
    pub sequence: u8,
    /// Present exactly when `packet_type.has_address2()`.
    pub address2: Option<u32>,
    pub body: Bytes,
}

impl RadioPacket {
    /// First packet of a PDM or POD message.
    pub fn first(
        address: u32,
        packet_type: PacketType,
        sequence: u8,
        message_address: u32,
        body: impl Into<Bytes>,
    ) -> Self {
        debug_assert!(matches!(packet_type, PacketType::Pdm | PacketType::Pod));
        Self {
            address,
            packet_type,
            sequence: sequence & SEQUENCE_MASK,
            address2: Some(message_address),
            body: body.into(),
        }
    }

    /// Continuation packet.
    pub fn con(address: u32, sequence: u8, body: impl Into<Bytes>) -> Self {
        Self {
            address,
            packet_type: PacketType::Con,
            sequence: sequence & SEQUENCE_MASK,
            address2: None,
            body: body.into(),
        }
    }

    /// Acknowledgment carrying an explicit second address.
    pub fn ack(address: u32, address2: u32, sequence: u8) -> Self {
        Self {
            address,
            packet_type: PacketType::Ack,
            sequence: sequence & SEQUENCE_MASK,
            address2: Some(address2),
            body: Bytes::new(),
        }
    }

    /// Acknowledgment that either continues (`final_ack == false`) or closes
    /// the conversation.
    pub fn make_ack(address: u32, sequence: u8, final_ack: bool) -> Self {
        let address2 = if final_ack { 0 } else { address };
        Self::ack(address, address2, sequence)
    }

    /// Decode raw packet bytes (CRC trailer included, no signal marker).
    pub fn parse(data: &[u8]) -> Result<Self, FramingError> {
        if data.len() < MIN_PACKET_LEN {
            return Err(FramingError::TooShort { len: data.len() });
        }

        let (content, trailer) = data.split_at(data.len() - 1);
        let computed = crc8(content);
        if trailer[0] != computed {
            return Err(FramingError::CrcMismatch {
                expected: computed,
                actual: trailer[0],
            });
        }
        if content.len() < PACKET_HEADER_LEN {
            return Err(FramingError::TooShort { len: data.len() });
        }

        let address = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
        let type_bits = content[4] >> 5;
        let packet_type =
            PacketType::from_bits(type_bits).ok_or(FramingError::UnknownType(type_bits))?;
        let sequence = content[4] & SEQUENCE_MASK;
        let rest = &content[PACKET_HEADER_LEN..];

        let bad_length = || FramingError::BadLength {
            packet_type,
            len: rest.len(),
        };

        let (address2, body) = match packet_type {
            PacketType::Con => {
                if rest.is_empty() || rest.len() > MAX_PACKET_BODY {
                    return Err(bad_length());
                }
                (None, rest)
            }
            PacketType::Ack => {
                if rest.len() != ADDRESS2_LEN {
                    return Err(bad_length());
                }
                (Some(read_address2(rest)), &rest[ADDRESS2_LEN..])
            }
            PacketType::Pdm | PacketType::Pod => {
                // address2 plus the two message header bytes, at minimum
                if rest.len() < ADDRESS2_LEN + 2 || rest.len() > MAX_PACKET_BODY {
                    return Err(bad_length());
                }
                (Some(read_address2(rest)), &rest[ADDRESS2_LEN..])
            }
        };

        if let Some(address2) = address2 {
            if address2 != address && address2 != 0 {
                return Err(FramingError::AddressMismatch { address, address2 });
            }
        }

        Ok(Self {
            address,
            packet_type,
            sequence,
            address2,
            body: Bytes::copy_from_slice(body),
        })
    }

    /// Encode to wire bytes with the CRC-8 trailer.
    pub fn serialize(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        dst.put_u32(self.address);
        dst.put_u8((self.packet_type.bits() << 5) | (self.sequence & SEQUENCE_MASK));
        if let Some(address2) = self.address2 {
            dst.put_u32(address2);
        }
        dst.put_slice(&self.body);
        let crc = crc8(&dst);
        dst.put_u8(crc);
        dst.freeze()
    }

    /// Copy of this packet with a different sequence.
    pub fn with_sequence(&self, sequence: u8) -> Self {
        Self {
            sequence: sequence & SEQUENCE_MASK,
            ..self.clone()
        }
    }

    /// Whether this packet releases the conversation (`address2 == 0`).
    pub fn is_final(&self) -> bool {
        self.address2 == Some(0)
    }

    /// Total encoded size including the CRC trailer.
    pub fn wire_size(&self) -> usize {
        let address2 = if self.address2.is_some() {
            ADDRESS2_LEN
        } else {
            0
        };
        PACKET_HEADER_LEN + address2 + self.body.len() + 1
    }
}

impl fmt::Display for RadioPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} addr={:08x} seq={:02}",
            self.packet_type, self.address, self.sequence
        )?;
        if let Some(address2) = self.address2 {
            write!(f, " addr2={address2:08x}")?;
        }
        if !self.body.is_empty() {
            f.write_str(" body=")?;
            for b in self.body.iter() {
                write!(f, "{b:02x}")?;
            }
        }
        Ok(())
    }
}

fn read_address2(rest: &[u8]) -> u32 {
    u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: u32 = 0x1f01_482a;

    fn with_crc(mut data: Vec<u8>) -> Vec<u8> {
        let crc = crc8(&data);
        data.push(crc);
        data
    }

    #[test]
    fn parse_final_ack() {
        let wire = with_crc(vec![0x1f, 0x01, 0x48, 0x2a, 0x45, 0, 0, 0, 0]);
        let packet = RadioPacket::parse(&wire).unwrap();

        assert_eq!(packet.packet_type, PacketType::Ack);
        assert_eq!(packet.address, ADDR);
        assert_eq!(packet.sequence, 5);
        assert!(packet.is_final());
        assert_eq!(packet.serialize().as_ref(), wire.as_slice());
    }

    #[test]
    fn make_ack_sets_address2() {
        let interim = RadioPacket::make_ack(ADDR, 3, false);
        assert_eq!(interim.address2, Some(ADDR));
        assert!(!interim.is_final());

        let last = RadioPacket::make_ack(ADDR, 3, true);
        assert!(last.is_final());
        assert_eq!(last.serialize().len(), 10);
    }

    #[test]
    fn roundtrip_pod_packet() {
        let wire = with_crc(vec![
            0x1f, 0x01, 0x48, 0x2a, 0xe0 | 0x0b, 0x1f, 0x01, 0x48, 0x2a, 0x0c, 0x0a, 0x1d, 0x18,
            0x00, 0x4e, 0x20, 0x00, 0x00, 0x0b, 0xf7, 0xff, 0x81, 0x45,
        ]);
        let packet = RadioPacket::parse(&wire).unwrap();
        assert_eq!(packet.packet_type, PacketType::Pod);
        assert_eq!(packet.sequence, 0x0b);
        assert_eq!(packet.address2, Some(ADDR));
        assert_eq!(packet.body.len(), wire.len() - 10);
        assert_eq!(packet.serialize().as_ref(), wire.as_slice());
    }

    #[test]
    fn roundtrip_con_packet() {
        let packet = RadioPacket::con(ADDR, 7, vec![1, 2, 3]);
        let wire = packet.serialize();
        assert_eq!(wire[4], 0x80 | 7);
        assert_eq!(RadioPacket::parse(&wire).unwrap(), packet);
    }

    #[test]
    fn rejects_short_buffer() {
        let err = RadioPacket::parse(&[0x1f, 0x01, 0x48, 0x2a]).unwrap_err();
        assert_eq!(err, FramingError::TooShort { len: 4 });
    }

    #[test]
    fn rejects_bad_crc() {
        let mut wire = RadioPacket::make_ack(ADDR, 1, true).serialize().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(matches!(
            RadioPacket::parse(&wire),
            Err(FramingError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let wire = with_crc(vec![0x1f, 0x01, 0x48, 0x2a, 0x20, 0, 0, 0, 0]);
        assert_eq!(
            RadioPacket::parse(&wire).unwrap_err(),
            FramingError::UnknownType(0b001)
        );
    }

    #[test]
    fn rejects_foreign_address2() {
        let wire = RadioPacket::ack(ADDR, 0x1234_5678, 2).serialize();
        assert_eq!(
            RadioPacket::parse(&wire).unwrap_err(),
            FramingError::AddressMismatch {
                address: ADDR,
                address2: 0x1234_5678
            }
        );
    }

    #[test]
    fn rejects_ack_with_body() {
        let wire = with_crc(vec![0x1f, 0x01, 0x48, 0x2a, 0x41, 0, 0, 0, 0, 9]);
        assert!(matches!(
            RadioPacket::parse(&wire),
            Err(FramingError::BadLength {
                packet_type: PacketType::Ack,
                ..
            })
        ));
    }

    #[test]
    fn rejects_empty_con() {
        let wire = with_crc(vec![0x1f, 0x01, 0x48, 0x2a, 0x81]);
        assert!(matches!(
            RadioPacket::parse(&wire),
            Err(FramingError::BadLength { .. })
        ));
    }

    #[test]
    fn with_sequence_wraps_into_five_bits() {
        let packet = RadioPacket::make_ack(ADDR, 31, false);
        assert_eq!(packet.with_sequence(32).sequence, 0);
        assert_eq!(packet.with_sequence(33).sequence, 1);
        assert_eq!(packet.sequence, 31);
    }

    #[test]
    fn display_includes_type_and_body() {
        let packet = RadioPacket::con(ADDR, 4, vec![0xab, 0xcd]);
        let text = packet.to_string();
        assert!(text.starts_with("CON addr=1f01482a seq=04"));
        assert!(text.ends_with("body=abcd"));
    }
}
