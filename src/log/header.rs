//! Log file sections
//!
//! The three fixed-size sections at the front of the log file. Each one is a
//! packed little-endian record, encoded with bincode's fixed-width layout.

use serde::{Deserialize, Serialize};

use crate::checksum::{compute_checksum, is_valid};
use crate::error::{FatWalError, Result};
use crate::volume::FREE_CLUSTER;

use super::{BASE_SIZE, CHAIN_SIZE, CONTENT_HEADER_SIZE, HEADER_SIZE, LOG_ID, VERSION_MAJOR, VERSION_MINOR};

/// Set while a splice is pending
pub const CHAIN_VALID: u8 = 0x01;

/// Set when the displaced range is tracked by the exFAT bitmap alone
pub const CHAIN_BITMAP_USED: u8 = 0x02;

fn encode_section<T: Serialize>(section: &T, size: usize) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(section)?;
    if bytes.len() != size {
        return Err(FatWalError::Serialization(format!(
            "section encoded to {} bytes, expected {}",
            bytes.len(),
            size
        )));
    }
    Ok(bytes)
}

/// Checksum of an encoded section with its 16-bit checksum field at `FIELD` zeroed
fn section_checksum<const FIELD: usize>(mut bytes: Vec<u8>) -> u16 {
    if let Some(field) = bytes.get_mut(FIELD..FIELD + 2) {
        field.fill(0);
    }
    compute_checksum(&bytes)
}

fn decode_section<'a, T: Deserialize<'a>>(bytes: &'a [u8], size: usize) -> Result<T> {
    if bytes.len() < size {
        return Err(FatWalError::FileCorrupt(format!(
            "section truncated: {} of {} bytes",
            bytes.len(),
            size
        )));
    }
    Ok(bincode::deserialize(&bytes[..size])?)
}

// =============================================================================
// Header
// =============================================================================

/// Log file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub id: u32,
    /// Total bytes of the log file, header through last entry
    pub total_size: u16,
    pub checksum: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub reserved: u16,
}

impl LogHeader {
    const CHECKSUM_FIELD: usize = 6;

    /// Header of an empty log
    pub fn empty() -> Self {
        Self {
            id: LOG_ID,
            total_size: BASE_SIZE as u16,
            checksum: 0,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            reserved: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_section(self, HEADER_SIZE)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_section(bytes, HEADER_SIZE)
    }

    /// Recompute the checksum field
    pub fn seal(&mut self) -> Result<()> {
        self.checksum = section_checksum::<{ LogHeader::CHECKSUM_FIELD }>(self.encode()?);
        Ok(())
    }

    /// ID, version and checksum all match
    pub fn is_valid(&self) -> Result<bool> {
        Ok(self.id == LOG_ID
            && self.version_major == VERSION_MAJOR
            && self.version_minor == VERSION_MINOR
            && is_valid(&self.encode()?))
    }
}

// =============================================================================
// FAT Chain
// =============================================================================

/// The single pending splice of a new cluster chain into an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatChain {
    pub checksum: u16,
    pub flags: u8,
    pub reserved: u8,
    /// Cluster before the splice point
    pub insertion_front: u32,
    /// Head of the newly allocated chain
    pub head_new: u32,
    /// Head of the chain being displaced
    pub head_original: u32,
    /// Cluster after the splice point
    pub insertion_back: u32,
    /// Resume cursor of a bounded cleanup
    pub next_deletion: u32,
}

impl Default for FatChain {
    fn default() -> Self {
        Self {
            checksum: 0,
            flags: 0,
            reserved: 0,
            insertion_front: FREE_CLUSTER,
            head_new: FREE_CLUSTER,
            head_original: FREE_CLUSTER,
            insertion_back: FREE_CLUSTER,
            next_deletion: FREE_CLUSTER,
        }
    }
}

impl FatChain {
    const CHECKSUM_FIELD: usize = 0;

    pub fn is_valid(&self) -> bool {
        self.flags & CHAIN_VALID != 0
    }

    pub fn bitmap_used(&self) -> bool {
        self.flags & CHAIN_BITMAP_USED != 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_section(self, CHAIN_SIZE)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_section(bytes, CHAIN_SIZE)
    }

    pub fn seal(&mut self) -> Result<()> {
        self.checksum = section_checksum::<{ FatChain::CHECKSUM_FIELD }>(self.encode()?);
        Ok(())
    }

    pub fn checksum_ok(&self) -> Result<bool> {
        Ok(is_valid(&self.encode()?))
    }
}

// =============================================================================
// Content Header
// =============================================================================

/// Precedes the entries; its checksum covers itself and every entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHeader {
    pub checksum: u16,
    pub count: u16,
}

impl ContentHeader {
    pub const CHECKSUM_FIELD: usize = 0;

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_section(self, CONTENT_HEADER_SIZE)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_section(bytes, CONTENT_HEADER_SIZE)
    }
}
