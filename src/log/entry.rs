//! Log entry definitions
//!
//! Every entry starts with `[type (2)][size (2)]`, where size covers the
//! whole entry including that prefix.
//!
//! ```text
//! FAT / bitmap:  [type][size = 12][cluster (4)][value (4)]
//! Directory:     [type][size = 16 + n][offset (4)][sector (8)][data (n)]
//! ```

use bytes::{Buf, BufMut};

use crate::error::{FatWalError, Result};

/// Size of a FAT or bitmap entry
pub const FAT_ENTRY_SIZE: usize = 12;

/// Size of a directory entry before its data bytes
pub const DIR_ENTRY_HEADER_SIZE: usize = 16;

const PREFIX_SIZE: usize = 4;

/// Entry type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LogKind {
    Fat = 1,
    Directory = 2,
    Bitmap = 3,
}

impl LogKind {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(LogKind::Fat),
            2 => Some(LogKind::Directory),
            3 => Some(LogKind::Bitmap),
            _ => None,
        }
    }
}

/// A decoded log entry, borrowing its data from the log buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry<'a> {
    /// Pending write to one FAT slot
    Fat { cluster: u32, value: u32 },

    /// Pending exFAT allocation bitmap state (non-zero = in use)
    Bitmap { cluster: u32, value: u32 },

    /// Byte-range overwrite of one logical sector
    Directory { sector: u64, offset: u32, data: &'a [u8] },

    /// Well-formed prefix with a type this version does not know
    Unknown { kind: u16, size: u16 },
}

impl<'a> LogEntry<'a> {
    /// Bytes this entry occupies in the log
    pub fn encoded_len(&self) -> usize {
        match self {
            LogEntry::Fat { .. } | LogEntry::Bitmap { .. } => FAT_ENTRY_SIZE,
            LogEntry::Directory { data, .. } => DIR_ENTRY_HEADER_SIZE + data.len(),
            LogEntry::Unknown { size, .. } => *size as usize,
        }
    }

    /// Append the encoded entry to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let size = u16::try_from(self.encoded_len()).map_err(|_| {
            FatWalError::Serialization(format!("entry of {} bytes is too large", self.encoded_len()))
        })?;

        match self {
            LogEntry::Fat { cluster, value } => {
                out.put_u16_le(LogKind::Fat.code());
                out.put_u16_le(size);
                out.put_u32_le(*cluster);
                out.put_u32_le(*value);
            }
            LogEntry::Bitmap { cluster, value } => {
                out.put_u16_le(LogKind::Bitmap.code());
                out.put_u16_le(size);
                out.put_u32_le(*cluster);
                out.put_u32_le(*value);
            }
            LogEntry::Directory { sector, offset, data } => {
                out.put_u16_le(LogKind::Directory.code());
                out.put_u16_le(size);
                out.put_u32_le(*offset);
                out.put_u64_le(*sector);
                out.put_slice(data);
            }
            LogEntry::Unknown { kind, .. } => {
                return Err(FatWalError::SectorInvalid(format!(
                    "cannot encode unknown entry type {}",
                    kind
                )));
            }
        }

        Ok(())
    }

    /// Decode the entry at the front of `bytes`
    ///
    /// Returns the entry and the number of bytes it occupies. The size field
    /// is checked against the remaining buffer before anything is read.
    pub fn decode(bytes: &'a [u8]) -> Result<(Self, usize)> {
        if bytes.len() < PREFIX_SIZE {
            return Err(FatWalError::FileCorrupt(format!(
                "entry prefix truncated: {} bytes left",
                bytes.len()
            )));
        }

        let mut prefix = &bytes[..PREFIX_SIZE];
        let kind = prefix.get_u16_le();
        let size = prefix.get_u16_le();
        let len = size as usize;

        if len < PREFIX_SIZE || len > bytes.len() {
            return Err(FatWalError::FileCorrupt(format!(
                "entry size {} does not fit the {} bytes left",
                len,
                bytes.len()
            )));
        }

        let mut body = &bytes[PREFIX_SIZE..len];

        let entry = match LogKind::from_code(kind) {
            Some(LogKind::Fat) | Some(LogKind::Bitmap) => {
                if len != FAT_ENTRY_SIZE {
                    return Err(FatWalError::FileCorrupt(format!(
                        "FAT/bitmap entry has size {}",
                        len
                    )));
                }
                let cluster = body.get_u32_le();
                let value = body.get_u32_le();
                if kind == LogKind::Fat.code() {
                    LogEntry::Fat { cluster, value }
                } else {
                    LogEntry::Bitmap { cluster, value }
                }
            }
            Some(LogKind::Directory) => {
                if len < DIR_ENTRY_HEADER_SIZE {
                    return Err(FatWalError::FileCorrupt(format!(
                        "directory entry has size {}",
                        len
                    )));
                }
                let offset = body.get_u32_le();
                let sector = body.get_u64_le();
                LogEntry::Directory {
                    sector,
                    offset,
                    data: &bytes[DIR_ENTRY_HEADER_SIZE..len],
                }
            }
            None => LogEntry::Unknown { kind, size },
        };

        Ok((entry, len))
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Walks the entry area front to back
///
/// Yields `(position, entry)` where position is the entry's byte offset in
/// the entry area. Stops after the first decode error.
pub struct EntryIter<'a> {
    bytes: &'a [u8],
    position: usize,
    failed: bool,
}

impl<'a> EntryIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<(usize, LogEntry<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.bytes.len() {
            return None;
        }

        match LogEntry::decode(&self.bytes[self.position..]) {
            Ok((entry, len)) => {
                let position = self.position;
                self.position += len;
                Some(Ok((position, entry)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
