//! Hashing utilities for minikv-client
//!
//! Partition placement must agree bit for bit with the server side, so the
//! checksum here is a fixed CRC-64 variant: reflected polynomial
//! `0x9a6c9329ac4bc9b5`, initial value and final xor all ones.

const CRC64_POLY: u64 = 0x9a6c_9329_ac4b_c9b5;

const CRC64_TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ CRC64_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the CRC-64 of data
pub fn crc64(data: &[u8]) -> u64 {
    let mut crc = !0u64;
    for &byte in data {
        crc = CRC64_TABLE[((crc ^ byte as u64) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

/// Compute the partition a hash key belongs to
pub fn partition_hash(hash_key: &[u8], partition_count: u32) -> u32 {
    (crc64(hash_key) % partition_count as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    // Bit-at-a-time reference for the table-driven version.
    fn crc64_bitwise(data: &[u8]) -> u64 {
        let mut crc = !0u64;
        for &byte in data {
            crc ^= byte as u64;
            for _ in 0..8 {
                let mask = (crc & 1).wrapping_neg();
                crc = (crc >> 1) ^ (CRC64_POLY & mask);
            }
        }
        !crc
    }

    #[test]
    fn test_crc64_empty() {
        assert_eq!(crc64(b""), 0);
    }

    #[test]
    fn test_crc64_matches_bitwise() {
        let samples: [&[u8]; 6] = [
            b"a",
            b"h0",
            b"hello world",
            b"123456789",
            &[0u8, 255, 1, 254, 128],
            &[0xAB; 300],
        ];
        for data in samples {
            assert_eq!(crc64(data), crc64_bitwise(data), "input {:?}", data);
        }
    }

    #[test]
    fn test_table_entries() {
        assert_eq!(CRC64_TABLE[0], 0);
        // index 128 is a single set bit shifted out exactly once, at the last step
        assert_eq!(CRC64_TABLE[128], CRC64_POLY);
    }

    #[test]
    fn test_partition_hash_deterministic() {
        let p1 = partition_hash(b"user-42", 8);
        let p2 = partition_hash(b"user-42", 8);
        assert_eq!(p1, p2);
        assert!(p1 < 8);
    }

    #[test]
    fn test_partition_hash_single_partition() {
        for key in [&b"a"[..], b"b", b"zzz"] {
            assert_eq!(partition_hash(key, 1), 0);
        }
    }

    #[test]
    fn test_partition_hash_spreads() {
        let mut seen = [false; 8];
        for i in 0..256 {
            seen[partition_hash(format!("h{}", i).as_bytes(), 8) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
