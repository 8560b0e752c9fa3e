//! Log buffer
//!
//! The in-memory log file: fixed sections plus an append-only entry area
//! bounded by the configured capacity.

use std::collections::HashMap;

use crate::checksum::{compute_checksum, is_valid};
use crate::error::{FatWalError, Result};

use super::entry::{EntryIter, LogEntry, LogKind, DIR_ENTRY_HEADER_SIZE};
use super::header::{ContentHeader, FatChain, LogHeader};
use super::{BASE_SIZE, CHAIN_OFFSET, CHAIN_SIZE, CONTENT_HEADER_SIZE, CONTENT_OFFSET, HEADER_SIZE};

/// Outcome of a redirected FAT or bitmap read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatLookup {
    /// The most recent logged value for the cluster
    Logged(u32),
    /// Nothing logged; read the real structure on media
    Continue,
}

/// In-memory log file
///
/// Entries are kept encoded, exactly as they are written to media. Directory
/// entries are also indexed by `(sector, offset)` so that exFAT checksum
/// patches can find the entry they belong to without rescanning.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: usize,
    header: LogHeader,
    chain: FatChain,
    content: ContentHeader,
    entries: Vec<u8>,
    /// Entries logged since the last reset
    entry_count: u32,
    /// (sector, offset) -> position of the latest directory entry
    dir_index: HashMap<(u64, u32), usize>,
}

impl LogBuffer {
    /// Create an empty log that may grow to `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self> {
        let mut buffer = Self {
            capacity,
            header: LogHeader::empty(),
            chain: FatChain::default(),
            content: ContentHeader::default(),
            entries: Vec::new(),
            entry_count: 0,
            dir_index: HashMap::new(),
        };
        buffer.reset()?;
        Ok(buffer)
    }

    /// Rebuild a log from a raw image read off media
    ///
    /// Only the first `header.total_size` bytes are used. Checksums are not
    /// checked here; every entry is decoded so that later scans can trust
    /// their sizes.
    pub fn from_image(image: &[u8], capacity: usize) -> Result<Self> {
        if image.len() < BASE_SIZE {
            return Err(FatWalError::FileCorrupt(format!(
                "log image of {} bytes is smaller than the log base",
                image.len()
            )));
        }

        let header = LogHeader::decode(&image[..HEADER_SIZE])?;
        let chain = FatChain::decode(&image[CHAIN_OFFSET..CHAIN_OFFSET + CHAIN_SIZE])?;
        let content = ContentHeader::decode(&image[CONTENT_OFFSET..BASE_SIZE])?;

        let total = header.total_size as usize;
        if total < BASE_SIZE || total > capacity || total > image.len() {
            return Err(FatWalError::FileCorrupt(format!(
                "log size {} outside [{}, {}]",
                total,
                BASE_SIZE,
                capacity.min(image.len())
            )));
        }

        let mut buffer = Self {
            capacity,
            header,
            chain,
            content,
            entries: image[BASE_SIZE..total].to_vec(),
            entry_count: 0,
            dir_index: HashMap::new(),
        };

        let mut count = 0u32;
        for item in EntryIter::new(&buffer.entries) {
            let (position, entry) = item?;
            if let LogEntry::Directory { sector, offset, .. } = entry {
                buffer.dir_index.insert((sector, offset), position);
            }
            count += 1;
        }
        buffer.entry_count = count;

        Ok(buffer)
    }

    /// Empty the log: no entries, no pending splice
    pub fn reset(&mut self) -> Result<()> {
        self.entries.clear();
        self.dir_index.clear();
        self.entry_count = 0;

        self.chain = FatChain::default();
        self.chain.seal()?;

        self.content = ContentHeader::default();
        self.seal_content()?;

        self.header = LogHeader::empty();
        self.header.seal()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Bytes the log currently occupies
    pub fn size(&self) -> usize {
        BASE_SIZE + self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn content(&self) -> &ContentHeader {
        &self.content
    }

    pub fn chain(&self) -> &FatChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut FatChain {
        &mut self.chain
    }

    pub fn entries(&self) -> EntryIter<'_> {
        EntryIter::new(&self.entries)
    }

    // =========================================================================
    // Appending
    // =========================================================================

    /// Log a pending FAT entry write
    pub fn add_fat_log(&mut self, cluster: u32, value: u32) -> Result<()> {
        self.append(&LogEntry::Fat { cluster, value })
    }

    /// Log a pending exFAT bitmap state
    pub fn add_bitmap_log(&mut self, cluster: u32, value: u32) -> Result<()> {
        self.append(&LogEntry::Bitmap { cluster, value })
    }

    /// Log a byte-range overwrite of a directory sector
    pub fn add_dir_log(&mut self, sector: u64, offset: u32, data: &[u8]) -> Result<()> {
        let position = self.entries.len();
        self.append(&LogEntry::Directory { sector, offset, data })?;
        self.dir_index.insert((sector, offset), position);
        Ok(())
    }

    /// Patch the SetChecksum field of an already logged exFAT entry set
    ///
    /// `offset` addresses the checksum field, which sits two bytes into the
    /// directory entry that was logged at `offset - 2`. Nothing is appended.
    pub fn add_checksum_log(&mut self, sector: u64, offset: u32, checksum: u16) -> Result<()> {
        let entry_offset = offset.checked_sub(2).ok_or_else(|| {
            FatWalError::FileCorrupt(format!("checksum offset {} precedes its entry", offset))
        })?;

        let position = *self.dir_index.get(&(sector, entry_offset)).ok_or_else(|| {
            FatWalError::FileCorrupt(format!(
                "no directory log at sector {} offset {} for checksum patch",
                sector, entry_offset
            ))
        })?;

        let (entry, len) = LogEntry::decode(&self.entries[position..])?;
        let data_len = match entry {
            LogEntry::Directory { data, .. } => data.len(),
            _ => {
                return Err(FatWalError::FileCorrupt(format!(
                    "index points at a non-directory entry at {}",
                    position
                )))
            }
        };

        if data_len < 4 {
            return Err(FatWalError::FileCorrupt(format!(
                "directory log of {} bytes has no checksum field",
                data_len
            )));
        }

        let field = position + DIR_ENTRY_HEADER_SIZE + 2;
        debug_assert!(field + 2 <= position + len);
        self.entries[field..field + 2].copy_from_slice(&checksum.to_le_bytes());

        Ok(())
    }

    fn append(&mut self, entry: &LogEntry<'_>) -> Result<()> {
        let needed = self.size() + entry.encoded_len();
        if needed > self.capacity {
            return Err(FatWalError::NoMoreSpace {
                needed,
                capacity: self.capacity,
            });
        }

        entry.encode_into(&mut self.entries)?;
        self.entry_count += 1;
        Ok(())
    }

    // =========================================================================
    // Redirected Reads
    // =========================================================================

    /// Look up the latest logged value for `cluster`
    ///
    /// Every entry is scanned; a later match replaces an earlier one.
    pub fn read_fat(&self, cluster: u32, kind: LogKind) -> Result<FatLookup> {
        if kind == LogKind::Directory {
            return Err(FatWalError::SectorInvalid(
                "directory entries hold no cluster values".to_string(),
            ));
        }

        let mut found = FatLookup::Continue;

        for item in self.entries() {
            let (_, entry) = item?;
            match (kind, entry) {
                (LogKind::Fat, LogEntry::Fat { cluster: c, value })
                | (LogKind::Bitmap, LogEntry::Bitmap { cluster: c, value })
                    if c == cluster =>
                {
                    found = FatLookup::Logged(value);
                }
                _ => {}
            }
        }

        Ok(found)
    }

    /// Overlay logged directory bytes onto `buffer`
    ///
    /// `buffer` holds consecutive sectors starting at `sector`, each
    /// `bytes_per_sector` long. Patches are applied in log order.
    pub fn read_directory_sector(
        &self,
        sector: u64,
        buffer: &mut [u8],
        bytes_per_sector: usize,
    ) -> Result<()> {
        let count = (buffer.len() / bytes_per_sector) as u64;

        for item in self.entries() {
            let (_, entry) = item?;
            let (log_sector, offset, data) = match entry {
                LogEntry::Directory { sector, offset, data } => (sector, offset as usize, data),
                _ => continue,
            };

            if log_sector < sector || log_sector >= sector + count {
                continue;
            }

            if offset + data.len() > bytes_per_sector {
                return Err(FatWalError::FileCorrupt(format!(
                    "directory log at offset {} with {} bytes overruns a {} byte sector",
                    offset,
                    data.len(),
                    bytes_per_sector
                )));
            }

            let start = (log_sector - sector) as usize * bytes_per_sector + offset;
            buffer[start..start + data.len()].copy_from_slice(data);
        }

        Ok(())
    }

    // =========================================================================
    // Finalizing
    // =========================================================================

    /// Store the entry count and checksums ahead of a flush
    ///
    /// The content section is sealed first; the header, which carries the
    /// total size, is sealed last.
    pub fn finalize(&mut self) -> Result<()> {
        self.content.count = u16::try_from(self.entry_count).map_err(|_| {
            FatWalError::FileCorrupt(format!("{} entries overflow the count field", self.entry_count))
        })?;
        self.seal_content()?;

        self.header.total_size = self.size() as u16;
        self.header.seal()
    }

    /// Recompute the chain checksum after editing it
    pub fn seal_chain(&mut self) -> Result<()> {
        self.chain.seal()
    }

    fn seal_content(&mut self) -> Result<()> {
        self.content.checksum = 0;
        let mut bytes = self.content.encode()?;
        bytes.extend_from_slice(&self.entries);
        self.content.checksum = compute_checksum(&bytes);
        Ok(())
    }

    /// Content checksum holds over the content header and entries
    pub fn content_checksum_ok(&self) -> Result<bool> {
        let mut bytes = self.content.encode()?;
        bytes.extend_from_slice(&self.entries);
        Ok(is_valid(&bytes))
    }

    /// The bytes to write to media
    pub fn image(&self) -> Result<Vec<u8>> {
        let mut image = Vec::with_capacity(self.size());
        image.extend_from_slice(&self.header.encode()?);
        image.extend_from_slice(&self.chain.encode()?);
        image.extend_from_slice(&self.content.encode()?);
        image.extend_from_slice(&self.entries);
        debug_assert_eq!(image.len(), BASE_SIZE + self.entries.len());
        debug_assert_eq!(BASE_SIZE, HEADER_SIZE + CHAIN_SIZE + CONTENT_HEADER_SIZE);
        Ok(image)
    }
}
