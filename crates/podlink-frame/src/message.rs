use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::crc16;
use crate::error::{ProtocolError, Result};
use crate::packet::{PacketType, RadioPacket, MAX_PACKET_BODY};

/// Message address (4) + flags/sequence byte + length byte.
pub const MESSAGE_HEADER_LEN: usize = 6;

/// Largest body expressible in the 10-bit length field.
pub const MAX_MESSAGE_BODY: usize = 0x3ff;

/// Status response part: runs to the end of the body with no length byte.
pub const STATUS_RESPONSE_TYPE: u8 = 0x1d;

/// Error response part.
pub const ERROR_RESPONSE_TYPE: u8 = 0x06;

/// First byte of an error response part rejecting the command nonce.
pub const BAD_NONCE_CODE: u8 = 0x14;

const CRC_LEN: usize = 2;
const MAX_PART_LEN: usize = u8::MAX as usize;
const NONCE_LEN: usize = 4;
const CRITICAL_FOLLOW_UP: u8 = 0x80;
const SEQUENCE_MASK: u8 = 0x0f;

/// One type/length-prefixed entry in a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    pub part_type: u8,
    pub payload: Bytes,
    /// Authorization nonce, encoded ahead of the payload.
    pub nonce: Option<u32>,
}

impl MessagePart {
    pub fn new(part_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            part_type,
            payload: payload.into(),
            nonce: None,
        }
    }

    /// A part that must be stamped with a nonce before sending.
    pub fn with_nonce(part_type: u8, nonce: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            part_type,
            payload: payload.into(),
            nonce: Some(nonce),
        }
    }

    /// Bytes following the length byte on the wire: nonce (if any) then payload.
    pub fn wire_payload(&self) -> Bytes {
        match self.nonce {
            None => self.payload.clone(),
            Some(nonce) => {
                let mut buf = BytesMut::with_capacity(NONCE_LEN + self.payload.len());
                buf.put_u32(nonce);
                buf.put_slice(&self.payload);
                buf.freeze()
            }
        }
    }

    /// Encoded length including the type and length bytes.
    pub fn wire_len(&self) -> usize {
        2 + self.payload.len() + self.nonce.map_or(0, |_| NONCE_LEN)
    }
}

/// A request built by a command collaborator. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdmMessage {
    parts: Vec<MessagePart>,
}

impl PdmMessage {
    pub fn new(parts: Vec<MessagePart>) -> Self {
        Self { parts }
    }

    /// Single-part message.
    pub fn single(part_type: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(vec![MessagePart::new(part_type, payload)])
    }

    pub fn parts(&self) -> &[MessagePart] {
        &self.parts
    }

    /// Sum of encoded part lengths.
    pub fn body_length(&self) -> usize {
        self.parts.iter().map(MessagePart::wire_len).sum()
    }

    /// Whether any part carries a nonce.
    pub fn has_nonce(&self) -> bool {
        self.parts.iter().any(|p| p.nonce.is_some())
    }

    /// Copy of this message with every nonce-bearing part re-stamped.
    pub fn with_nonce(&self, nonce: u32) -> Self {
        let parts = self
            .parts
            .iter()
            .map(|part| match part.nonce {
                Some(_) => MessagePart {
                    nonce: Some(nonce),
                    ..part.clone()
                },
                None => part.clone(),
            })
            .collect();
        Self { parts }
    }

    /// Serialize header, body and CRC-16 into one contiguous stream.
    pub fn encode(
        &self,
        message_address: u32,
        message_sequence: u8,
        critical_follow_up: bool,
    ) -> Result<Bytes> {
        let body_length = self.body_length();
        if body_length > MAX_MESSAGE_BODY {
            return Err(ProtocolError::MessageTooLong {
                len: body_length,
                max: MAX_MESSAGE_BODY,
            });
        }

        if let Some(part) = self.parts.iter().find(|p| p.wire_len() - 2 > MAX_PART_LEN) {
            return Err(ProtocolError::PartTooLong {
                part_type: part.part_type,
                len: part.wire_len() - 2,
            });
        }

        let mut b0 = (message_sequence & SEQUENCE_MASK) << 2;
        if critical_follow_up {
            b0 |= CRITICAL_FOLLOW_UP;
        }
        b0 |= ((body_length >> 8) & 0x03) as u8;

        let mut dst = BytesMut::with_capacity(MESSAGE_HEADER_LEN + body_length + CRC_LEN);
        dst.put_u32(message_address);
        dst.put_u8(b0);
        dst.put_u8((body_length & 0xff) as u8);
        for part in &self.parts {
            dst.put_u8(part.part_type);
            dst.put_u8((part.wire_len() - 2) as u8);
            if let Some(nonce) = part.nonce {
                dst.put_u32(nonce);
            }
            dst.put_slice(&part.payload);
        }
        let crc = crc16(&dst);
        dst.put_u16(crc);
        Ok(dst.freeze())
    }

    /// Fragment into radio packets.
    ///
    /// The first packet is type PDM and carries the message header, the rest
    /// are CON. Packet sequences step by two so the pod's ACKs interleave.
    pub fn get_radio_packets(
        &self,
        message_address: u32,
        message_sequence: u8,
        packet_address: u32,
        first_packet_sequence: u8,
        critical_follow_up: bool,
    ) -> Result<Vec<RadioPacket>> {
        let stream = self.encode(message_address, message_sequence, critical_follow_up)?;

        let mut packets = Vec::with_capacity(stream.len() / MAX_PACKET_BODY + 1);
        let first_len = stream.len().min(MAX_PACKET_BODY);
        packets.push(RadioPacket::first(
            packet_address,
            PacketType::Pdm,
            first_packet_sequence,
            message_address,
            stream.slice(4..first_len),
        ));

        let mut offset = first_len;
        while offset < stream.len() {
            let end = (offset + MAX_PACKET_BODY).min(stream.len());
            let sequence = first_packet_sequence.wrapping_add(2 * packets.len() as u8) % 32;
            packets.push(RadioPacket::con(
                packet_address,
                sequence,
                stream.slice(offset..end),
            ));
            offset = end;
        }

        Ok(packets)
    }
}

/// A response reassembled from POD + CON packets.
#[derive(Debug, Clone, Default)]
pub struct PodMessage {
    header: Option<[u8; MESSAGE_HEADER_LEN]>,
    data: BytesMut,
    parts: Vec<MessagePart>,
    complete: bool,
}

impl PodMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next packet. Returns `Ok(true)` once the declared length has
    /// arrived and the CRC-16 verifies.
    pub fn add_radio_packet(&mut self, packet: &RadioPacket) -> Result<bool> {
        if self.complete {
            return Err(ProtocolError::AlreadyComplete);
        }

        match self.header {
            None => {
                if packet.packet_type != PacketType::Pod {
                    return Err(ProtocolError::UnexpectedPacketType {
                        expected: PacketType::Pod,
                        actual: packet.packet_type,
                    });
                }
                let address = packet.address2.unwrap_or(packet.address).to_be_bytes();
                if packet.body.len() < 2 {
                    return Err(ProtocolError::MalformedPart { offset: 0 });
                }
                self.header = Some([
                    address[0],
                    address[1],
                    address[2],
                    address[3],
                    packet.body[0],
                    packet.body[1],
                ]);
                self.data.extend_from_slice(&packet.body[2..]);
            }
            Some(_) => {
                if packet.packet_type != PacketType::Con {
                    return Err(ProtocolError::UnexpectedPacketType {
                        expected: PacketType::Con,
                        actual: packet.packet_type,
                    });
                }
                self.data.extend_from_slice(&packet.body);
            }
        }

        self.update_state()
    }

    fn update_state(&mut self) -> Result<bool> {
        let Some(header) = self.header else {
            return Ok(false);
        };
        let declared = self.body_length();
        let expected = declared + CRC_LEN;

        if self.data.len() < expected {
            return Ok(false);
        }
        if self.data.len() > expected {
            return Err(ProtocolError::LengthOverflow {
                declared: expected,
                received: self.data.len(),
            });
        }

        let mut covered = BytesMut::with_capacity(MESSAGE_HEADER_LEN + declared);
        covered.put_slice(&header);
        covered.put_slice(&self.data[..declared]);
        let computed = crc16(&covered);
        let received = u16::from_be_bytes([self.data[declared], self.data[declared + 1]]);
        if computed != received {
            tracing::debug!(
                target: "podlink::packet",
                expected = computed,
                actual = received,
                "message crc mismatch"
            );
            return Err(ProtocolError::CrcMismatch {
                expected: computed,
                actual: received,
            });
        }

        self.parts = decode_parts(&self.data[..declared])?;
        self.complete = true;
        tracing::trace!(
            target: "podlink::packet",
            sequence = self.sequence(),
            parts = self.parts.len(),
            "message reassembled"
        );
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Message address from the header.
    pub fn address(&self) -> Option<u32> {
        self.header
            .map(|h| u32::from_be_bytes([h[0], h[1], h[2], h[3]]))
    }

    /// 4-bit message sequence.
    pub fn sequence(&self) -> u8 {
        self.header.map_or(0, |h| (h[4] >> 2) & SEQUENCE_MASK)
    }

    pub fn critical_follow_up(&self) -> bool {
        self.header.is_some_and(|h| h[4] & CRITICAL_FOLLOW_UP != 0)
    }

    /// Declared 10-bit body length.
    pub fn body_length(&self) -> usize {
        self.header
            .map_or(0, |h| (((h[4] & 0x03) as usize) << 8) | h[5] as usize)
    }

    /// Body bytes received so far, excluding the CRC once complete.
    pub fn body(&self) -> &[u8] {
        let end = self.data.len().min(self.body_length());
        &self.data[..end]
    }

    /// Decoded parts; empty until complete.
    pub fn parts(&self) -> &[MessagePart] {
        &self.parts
    }

    /// First part of the given type.
    pub fn part(&self, part_type: u8) -> Option<&MessagePart> {
        self.parts.iter().find(|p| p.part_type == part_type)
    }

    /// Sync word from a bad-nonce error response, if this is one.
    pub fn nonce_sync_word(&self) -> Option<u16> {
        self.parts
            .iter()
            .filter(|p| p.part_type == ERROR_RESPONSE_TYPE)
            .find_map(|p| match p.payload.as_ref() {
                [BAD_NONCE_CODE, hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
                _ => None,
            })
    }
}

impl std::fmt::Display for PodMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "POD msg seq={:02}", self.sequence())?;
        if self.critical_follow_up() {
            f.write_str(" critical")?;
        }
        for part in &self.parts {
            write!(f, " {:02x}:", part.part_type)?;
            for b in part.payload.iter() {
                write!(f, "{b:02x}")?;
            }
        }
        Ok(())
    }
}

fn decode_parts(body: &[u8]) -> Result<Vec<MessagePart>> {
    let mut parts = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        let part_type = body[offset];
        if part_type == STATUS_RESPONSE_TYPE {
            parts.push(MessagePart::new(
                part_type,
                Bytes::copy_from_slice(&body[offset + 1..]),
            ));
            break;
        }

        let len = *body
            .get(offset + 1)
            .ok_or(ProtocolError::MalformedPart { offset })? as usize;
        let start = offset + 2;
        let payload = body
            .get(start..start + len)
            .ok_or(ProtocolError::MalformedPart { offset })?;
        parts.push(MessagePart::new(part_type, Bytes::copy_from_slice(payload)));
        offset = start + len;
    }

    Ok(parts)
}
