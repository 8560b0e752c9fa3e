//! # fatwal
//!
//! A fault tolerant transaction log for FAT and exFAT volumes:
//! - Redo log of FAT, bitmap and directory updates, checksummed per section
//! - Redirected reads so a transaction sees its own pending writes
//! - Single pending chain splice, freed in bounded, resumable sessions
//! - Replay or undo after power loss
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Filesystem (FAT / exFAT)                   │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                         Media                               │
//! │              (routes by transaction state)                  │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌──────────────┐          ┌─────────────┐
//!   │TransactionLog│─────────▶│  LogBuffer  │
//!   │ (start/end)  │          │  (entries)  │
//!   └──────┬───────┘          └─────────────┘
//!          │ apply / cleanup / log file I/O
//!          ▼
//!   ┌─────────────┐
//!   │   Volume    │
//!   │ FAT, bitmap │
//!   │ sector cache│
//!   └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod checksum;

pub mod log;
pub mod volume;
pub mod transaction;
pub mod media;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{FatWalError, Result};
pub use config::Config;
pub use log::{FatLookup, LogBuffer, LogEntry, LogKind};
pub use volume::{FatType, Geometry, RamVolume, SectorKind, Volume};
pub use transaction::{CleanupMode, LogFileState, TransactionLog, TransactionState};
pub use media::{Media, SharedMedia};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of fatwal
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
