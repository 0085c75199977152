//! # Checksum Utility
//!
//! Table-driven CRC-16 used to mint slot validation stamps.
//!
//! The variant is CRC-16/ARC: reflected polynomial `0xA001`, initial value
//! zero, no final xor. The 256-entry lookup table is computed at compile
//! time, so there is nothing to initialise or synchronise at runtime.
//!
//! The checksum only has to make stale handles unlikely to validate against
//! a reused slot. It is not a cryptographic primitive.

/// Reflected form of the CRC-16/ARC polynomial `0x8005`.
const POLY: u16 = 0xA001;

/// Byte-indexed lookup table.
static TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the checksum of `bytes` starting from zero.
pub fn crc16(bytes: &[u8]) -> u16 {
    crc16_update(0, bytes)
}

/// Continue a running checksum over `bytes`.
pub fn crc16_update(crc: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(crc, |crc, &b| {
        (crc >> 8) ^ TABLE[((crc ^ b as u16) & 0xFF) as usize]
    })
}

/// Fold the raw bytes of a plain-old-data value into a running checksum.
///
/// Byte order is the host's, which is fine for stamps that never leave the
/// process.
pub fn fold_value<T: bytemuck::Pod>(crc: u16, value: &T) -> u16 {
    crc16_update(crc, bytemuck::bytes_of(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // Standard CRC-16/ARC check input.
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc16(&[]), 0);
        assert_eq!(crc16_update(0x1234, &[]), 0x1234);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"slot table validation stamp";
        let (head, tail) = data.split_at(7);
        assert_eq!(crc16_update(crc16(head), tail), crc16(data));
    }

    #[test]
    fn test_fold_value_uses_native_bytes() {
        let value: u64 = 0x0102_0304_0506_0708;
        assert_eq!(fold_value(0, &value), crc16(&value.to_ne_bytes()));
    }

    #[test]
    fn test_table_first_entries() {
        assert_eq!(TABLE[0], 0x0000);
        assert_eq!(TABLE[1], 0xC0C1);
        assert_eq!(TABLE[255], 0x4040);
    }
}
