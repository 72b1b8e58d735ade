//! # Frame Checksums
//!
//! CRC-8/DVB-S2 for MSP v2 frames.
//! **Polynomial**: 0xD5 (x^8 + x^7 + x^6 + x^4 + x^2 + 1), **Initial Value**: 0x00

/// CRC-8-DVB-S2 polynomial
const CRC8_POLY: u8 = 0xD5;

/// Precomputed CRC8 lookup table for fast calculation
const CRC8_TABLE: [u8; 256] = generate_crc8_table();

/// Generate CRC8 lookup table at compile time
const fn generate_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u8;
        let mut j = 0;

        while j < 8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Fold `data` into a running CRC8-DVB-S2 value
///
/// MSP v2 checksums span non-contiguous header fields and the payload, so
/// callers feed the pieces one after another starting from 0.
pub fn crc8_dvb_s2_update(mut crc: u8, data: &[u8]) -> u8 {
    for &byte in data {
        crc = CRC8_TABLE[(crc ^ byte) as usize];
    }
    crc
}

/// Calculate CRC8-DVB-S2 checksum using lookup table (fast)
///
/// # Examples
///
/// ```
/// use fpv_air_link::codec::crc::crc8_dvb_s2;
///
/// // flag, code LE, len LE of an empty MSP_API_VERSION request
/// let crc = crc8_dvb_s2(&[0x00, 0x01, 0x00, 0x00, 0x00]);
/// assert_eq!(crc, 0x45);
/// ```
pub fn crc8_dvb_s2(data: &[u8]) -> u8 {
    crc8_dvb_s2_update(0, data)
}

/// Calculate CRC8-DVB-S2 checksum using direct algorithm (slow, for verification)
#[cfg(test)]
fn crc8_dvb_s2_slow(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;

    for &byte in data {
        crc ^= byte;

        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}
