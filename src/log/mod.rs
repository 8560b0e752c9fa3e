//! Fault Tolerant Log Module
//!
//! In-memory image of the log file plus the codec for its entries.
//!
//! ## Responsibilities
//! - Append FAT, bitmap and directory redo entries in arrival order
//! - Patch exFAT entry-set checksums inside logged directory entries
//! - Answer redirected FAT/bitmap reads (last logged write wins)
//! - Overlay logged directory bytes onto sectors read from media
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (12)                                              │
//! │   ID (4) | Size (2) | Checksum (2) | Major (1) | Minor (1)│
//! │   Reserved (2)                                           │
//! ├──────────────────────────────────────────────────────────┤
//! │ FAT Chain (24)                                           │
//! │   Checksum (2) | Flags (1) | Reserved (1)                │
//! │   Front (4) | New Head (4) | Original Head (4)           │
//! │   Back (4) | Next Deletion (4)                           │
//! ├──────────────────────────────────────────────────────────┤
//! │ Content Header (4)                                       │
//! │   Checksum (2) | Entry Count (2)                         │
//! ├──────────────────────────────────────────────────────────┤
//! │ Entries                                                  │
//! │   [Type (2)][Size (2)][Body]                             │
//! │   ... repeated, in the order they were logged ...        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

mod buffer;
mod entry;
mod header;

pub use buffer::{FatLookup, LogBuffer};
pub use entry::{EntryIter, LogEntry, LogKind, DIR_ENTRY_HEADER_SIZE, FAT_ENTRY_SIZE};
pub use header::{ContentHeader, FatChain, LogHeader, CHAIN_BITMAP_USED, CHAIN_VALID};

// =============================================================================
// Layout Constants
// =============================================================================

/// Magic bytes identifying a log file ("FTLG" read as a little-endian u32)
pub const LOG_ID: u32 = u32::from_le_bytes(*b"FTLG");

/// Current log format version
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Header size: ID (4) + Size (2) + Checksum (2) + Version (2) + Reserved (2)
pub const HEADER_SIZE: usize = 12;

/// FAT chain size: Checksum (2) + Flags (2) + 5 clusters (20)
pub const CHAIN_SIZE: usize = 24;

/// Content header size: Checksum (2) + Count (2)
pub const CONTENT_HEADER_SIZE: usize = 4;

pub const CHAIN_OFFSET: usize = HEADER_SIZE;
pub const CONTENT_OFFSET: usize = CHAIN_OFFSET + CHAIN_SIZE;

/// Size of an empty log; entries start here
pub const BASE_SIZE: usize = CONTENT_OFFSET + CONTENT_HEADER_SIZE;
