//! Tests for the log checksum
//!
//! These tests verify:
//! - Known values for small inputs
//! - Verification accepts the computed checksum and rejects bit flips
//! - Sealed sections recheck to zero
//! - Zero padding of trailing bytes

use fatwal::checksum::{compute_checksum, is_valid, verify_checksum};
use fatwal::log::{FatChain, LogHeader, CHAIN_VALID};

// =============================================================================
// Helper Functions
// =============================================================================

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// =============================================================================
// Known Values
// =============================================================================

#[test]
fn test_checksum_of_empty_is_all_ones() {
    assert_eq!(compute_checksum(&[]), 0xFFFF);
}

#[test]
fn test_checksum_of_zeros_is_all_ones() {
    assert_eq!(compute_checksum(&[0u8; 64]), 0xFFFF);
}

#[test]
fn test_checksum_adds_both_halves_of_each_word() {
    // Word 0x0002_0001 contributes 0x0002 + 0x0001
    let data = 0x0002_0001u32.to_le_bytes();
    assert_eq!(compute_checksum(&data), !0x0003u16);
}

#[test]
fn test_checksum_folds_carries() {
    // 0xFFFF + 0x0001 = 0x10000, folded to 0x0001
    let data = 0xFFFF_0001u32.to_le_bytes();
    assert_eq!(compute_checksum(&data), !0x0001u16);
}

#[test]
fn test_trailing_bytes_are_zero_padded() {
    let short = [0x12, 0x34, 0x56];
    let padded = [0x12, 0x34, 0x56, 0x00];
    assert_eq!(compute_checksum(&short), compute_checksum(&padded));
}

// =============================================================================
// Verification
// =============================================================================

#[test]
fn test_verify_accepts_computed_checksum() {
    for len in [4, 8, 40, 128, 512] {
        let data = pattern(len, len as u8);
        assert!(verify_checksum(&data, compute_checksum(&data)), "len {}", len);
    }
}

#[test]
fn test_single_bit_flip_fails_verification() {
    let data = pattern(64, 7);
    let checksum = compute_checksum(&data);

    for byte in [0, 1, 2, 3, 17, 63] {
        for bit in 0..8 {
            let mut corrupted = data.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                !verify_checksum(&corrupted, checksum),
                "flip of byte {} bit {} went unnoticed",
                byte,
                bit
            );
        }
    }
}

#[test]
fn test_sealed_section_is_valid() {
    let mut chain = FatChain {
        flags: CHAIN_VALID,
        insertion_front: 20,
        head_new: 30,
        head_original: 21,
        insertion_back: 25,
        ..FatChain::default()
    };
    chain.seal().unwrap();

    assert!(is_valid(&chain.encode().unwrap()));
    assert!(chain.checksum_ok().unwrap());

    chain.head_new = 31;
    assert!(!chain.checksum_ok().unwrap());
}

#[test]
fn test_seal_ignores_stale_checksum() {
    let mut header = LogHeader::empty();
    header.seal().unwrap();
    let sealed = header.checksum;

    header.checksum = 0xA55A;
    header.seal().unwrap();

    assert_eq!(header.checksum, sealed);
    assert!(header.is_valid().unwrap());
}
