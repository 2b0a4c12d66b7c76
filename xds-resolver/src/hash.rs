//! 64-bit xxHash with a fixed zero seed.
//!
//! Consistent-hash load balancing needs the exact same key for the same
//! inputs across clients and releases, so the function is implemented here
//! rather than delegated to a hasher whose output could drift.

const PRIME64_1: u64 = 0x9E37_79B1_85EB_CA87;
const PRIME64_2: u64 = 0xC2B2_AE3D_27D4_EB4F;
const PRIME64_3: u64 = 0x1656_67B1_9E37_79F9;
const PRIME64_4: u64 = 0x85EB_CA77_C2B2_AE63;
const PRIME64_5: u64 = 0x27D4_EB2F_1656_67C5;

/// Hashes the bytes of an ASCII/UTF-8 string.
pub fn hash_ascii_string(value: &str) -> u64 {
    hash_bytes(value.as_bytes())
}

/// Hashes the eight little-endian bytes of `value`.
pub fn hash_long(value: u64) -> u64 {
    hash_bytes(&value.to_le_bytes())
}

/// xxHash64 of `data` with seed zero.
pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut remaining = data;
    let mut hash;

    if data.len() >= 32 {
        let mut v1 = PRIME64_1.wrapping_add(PRIME64_2);
        let mut v2 = PRIME64_2;
        let mut v3 = 0u64;
        let mut v4 = 0u64.wrapping_sub(PRIME64_1);
        while remaining.len() >= 32 {
            v1 = round(v1, read_u64(&remaining[0..8]));
            v2 = round(v2, read_u64(&remaining[8..16]));
            v3 = round(v3, read_u64(&remaining[16..24]));
            v4 = round(v4, read_u64(&remaining[24..32]));
            remaining = &remaining[32..];
        }
        hash = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));
        hash = merge_round(hash, v1);
        hash = merge_round(hash, v2);
        hash = merge_round(hash, v3);
        hash = merge_round(hash, v4);
    } else {
        hash = PRIME64_5;
    }

    hash = hash.wrapping_add(data.len() as u64);

    while remaining.len() >= 8 {
        hash ^= round(0, read_u64(&remaining[0..8]));
        hash = hash
            .rotate_left(27)
            .wrapping_mul(PRIME64_1)
            .wrapping_add(PRIME64_4);
        remaining = &remaining[8..];
    }
    if remaining.len() >= 4 {
        hash ^= u64::from(read_u32(&remaining[0..4])).wrapping_mul(PRIME64_1);
        hash = hash
            .rotate_left(23)
            .wrapping_mul(PRIME64_2)
            .wrapping_add(PRIME64_3);
        remaining = &remaining[4..];
    }
    for &byte in remaining {
        hash ^= u64::from(byte).wrapping_mul(PRIME64_5);
        hash = hash.rotate_left(11).wrapping_mul(PRIME64_1);
    }

    avalanche(hash)
}

fn round(acc: u64, input: u64) -> u64 {
    acc.wrapping_add(input.wrapping_mul(PRIME64_2))
        .rotate_left(31)
        .wrapping_mul(PRIME64_1)
}

fn merge_round(hash: u64, value: u64) -> u64 {
    (hash ^ round(0, value))
        .wrapping_mul(PRIME64_1)
        .wrapping_add(PRIME64_4)
}

fn avalanche(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(PRIME64_2);
    hash ^= hash >> 29;
    hash = hash.wrapping_mul(PRIME64_3);
    hash ^= hash >> 32;
    hash
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
