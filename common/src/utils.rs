//! Common Utilities
//!
//! Provides utility functions used across the eNodeB implementation

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[bool]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first)
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte & (1 << (7 - i))) != 0);
        }
    }

    bits
}

/// Append the low `num_bits` of `value` to a bit vector, MSB first
pub fn value_to_bits(value: u32, num_bits: usize, bits: &mut Vec<bool>) {
    for i in (0..num_bits).rev() {
        bits.push((value >> i) & 1 == 1);
    }
}

/// Read `num_bits` starting at `*pos` as an unsigned value, advancing `*pos`
///
/// Returns `None` if fewer than `num_bits` remain.
pub fn bits_to_value(bits: &[bool], pos: &mut usize, num_bits: usize) -> Option<u32> {
    let end = pos.checked_add(num_bits)?;
    if end > bits.len() {
        return None;
    }

    let value = bits[*pos..end]
        .iter()
        .fold(0u32, |acc, &bit| (acc << 1) | bit as u32);
    *pos = end;
    Some(value)
}

/// Parse a fixed-width decimal digit string (IMSI, IMEI)
pub fn digits_to_number(digits: &str, num_digits: usize) -> Option<u64> {
    if digits.len() != num_digits || !digits.bytes().all(|b| b.is_ascii_digit()) {
        trace!("Rejecting digit string {:?}, expected {} digits", digits, num_digits);
        return None;
    }
    digits.parse().ok()
}

/// Format a number as a zero-padded fixed-width digit string
pub fn number_to_digits(value: u64, num_digits: usize) -> String {
    format!("{:0width$}", value, width = num_digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_bit_packing() {
        let bits = vec![true, false, true, false, true, false, true, false];
        let packed = pack_bits(&bits);
        assert_eq!(packed[0], 0xAA); // 10101010

        let unpacked = unpack_bits(&packed);
        assert_eq!(unpacked[..8], bits);
    }

    #[test]
    fn test_value_bits() {
        let mut bits = Vec::new();
        value_to_bits(0x2A5, 10, &mut bits);
        value_to_bits(1, 1, &mut bits);
        assert_eq!(bits.len(), 11);

        let mut pos = 0;
        assert_eq!(bits_to_value(&bits, &mut pos, 10), Some(0x2A5));
        assert_eq!(bits_to_value(&bits, &mut pos, 1), Some(1));
        assert_eq!(pos, 11);
        assert_eq!(bits_to_value(&bits, &mut pos, 1), None);
        assert_eq!(pos, 11);
    }

    #[test]
    fn test_digits() {
        assert_eq!(digits_to_number("001010123456789", 15), Some(1010123456789));
        assert_eq!(digits_to_number("00101012345678", 15), None);
        assert_eq!(digits_to_number("00101012345678x", 15), None);
        assert_eq!(number_to_digits(1010123456789, 15), "001010123456789");
    }
}
