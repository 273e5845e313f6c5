//! Table-driven checksums used by the pod firmware.
//!
//! CRC-8 guards every radio packet; CRC-16 guards every message. The CRC-16
//! table is also an input to nonce resynchronization, so both tables are
//! bit-for-bit fixed.

const CRC8_POLY: u8 = 0x07;
const CRC16_POLY: u16 = 0x8005;

static CRC8_TABLE: [u8; 256] = build_crc8_table();
static CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-8 (poly 0x07, init 0) over `data`.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| CRC8_TABLE[(acc ^ b) as usize])
}

/// Message CRC-16 over `data`.
///
/// The firmware folds an MSB-first 0x8005 table with a right shift; this is
/// not any of the catalogued CRC-16 variants.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| {
        (acc >> 8) ^ CRC16_TABLE[((acc ^ b as u16) & 0xff) as usize]
    })
}

/// The CRC-16 lookup table.
pub fn crc16_table() -> &'static [u16; 256] {
    &CRC16_TABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_table_head() {
        assert_eq!(&CRC8_TABLE[..8], &[0x00, 0x07, 0x0e, 0x09, 0x1c, 0x1b, 0x12, 0x15]);
    }

    #[test]
    fn crc16_table_head() {
        assert_eq!(
            &crc16_table()[..8],
            &[0x0000, 0x8005, 0x800f, 0x000a, 0x801b, 0x001e, 0x0014, 0x8011]
        );
    }

    #[test]
    fn crc8_check_value() {
        assert_eq!(crc8(b"123456789"), 0xf4);
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn crc8_of_final_ack() {
        let ack = [0x1f, 0x01, 0x48, 0x2a, 0x45, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(crc8(&ack), 0x93);
    }

    #[test]
    fn crc16_status_request_pin() {
        // address 0x1f01482a, sequence 0, body 02 07 00
        let data = [0x1f, 0x01, 0x48, 0x2a, 0x00, 0x03, 0x02, 0x07, 0x00];
        assert_eq!(crc16(&data), 0x015c);
    }

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x0265);
        assert_eq!(crc16(&[]), 0);
    }
}
