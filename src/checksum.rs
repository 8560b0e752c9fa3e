//! Log checksum
//!
//! 16-bit ones'-complement checksum used by every section of the log file.
//!
//! The data is summed as little-endian 32-bit words, each word contributing
//! its high and low halves. The carries are folded back into 16 bits and the
//! result is complemented. A trailing partial word is zero-padded.
//!
//! A section stores the checksum of itself computed with the checksum field
//! zeroed. Recomputing over the section with the stored value in place then
//! yields zero, which is what [`verify_checksum`] and [`is_valid`] test.

/// Compute the checksum of `data`
pub fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u64 = 0;

    let mut words = data.chunks_exact(4);
    for word in &mut words {
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        sum += u64::from(value >> 16) + u64::from(value & 0xFFFF);
    }

    let tail = words.remainder();
    if !tail.is_empty() {
        let mut padded = [0u8; 4];
        padded[..tail.len()].copy_from_slice(tail);
        let value = u32::from_le_bytes(padded);
        sum += u64::from(value >> 16) + u64::from(value & 0xFFFF);
    }

    while sum > 0xFFFF {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !(sum as u16)
}

/// Check a section whose checksum field already holds its checksum
pub fn is_valid(section: &[u8]) -> bool {
    compute_checksum(section) == 0
}

/// Check `data` against a checksum computed separately
///
/// Folding the checksum into the sum of the data must give the all-ones value.
pub fn verify_checksum(data: &[u8], checksum: u16) -> bool {
    let computed = !compute_checksum(data) as u32;
    let mut sum = computed + checksum as u32;
    while sum > 0xFFFF {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    sum == 0xFFFF
}
