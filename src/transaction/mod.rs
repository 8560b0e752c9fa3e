//! Transaction Module
//!
//! Owns the log for one volume and drives its lifecycle.
//!
//! ## Responsibilities
//! - Reference counted start/end/fail so nested routines share one transaction
//! - Finalize, flush and apply the log at the outermost end
//! - Record the pending chain splice and free displaced chains in sessions
//! - Replay or undo a log left behind by a power loss (see [`TransactionLog::enable`])
//!
//! ## State Machine
//! ```text
//!          start (0 -> 1)              set_fat_chain
//!   IDLE ───────────────────▶ STARTED ◀──────────────▶ SET_FAT_CHAIN
//!    ▲                           │       end_undo_phase      │
//!    └───────────────────────────┴──────────────────────────┘
//!               end / fail (1 -> 0)
//! ```
//!
//! While STARTED, FAT writes are logged. SET_FAT_CHAIN is the undo phase:
//! the splice is on media, so the links of the new chain and the front link
//! go straight to the FAT through a one-sector cache and [`TransactionLog::recover`]
//! can take them back. The log stays the same size however long the chain.

mod apply;
mod chain;
mod file;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{FatWalError, Result};
use crate::log::{FatChain, FatLookup, LogBuffer, LogKind, BASE_SIZE};
use crate::volume::Volume;

pub use chain::CleanupMode;
pub use file::LogFileState;

/// Lifecycle state of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Started,
    SetFatChain,
}

/// Fault tolerant log of one volume
#[derive(Debug)]
pub struct TransactionLog {
    config: Config,

    /// In-memory log file
    buffer: LogBuffer,

    state: TransactionState,

    /// Nesting depth; only the 0 <-> 1 transitions do I/O
    transaction_count: u32,

    /// First cluster of the log file
    start_cluster: u32,

    /// Consecutive clusters the log file occupies
    clusters: u32,

    bytes_per_sector: usize,

    fat_cache: FatSectorCache,
}

impl TransactionLog {
    /// Enable fault tolerance on a volume
    ///
    /// On startup:
    /// 1. Find the log file through the boot sector, or allocate one
    /// 2. Read and classify whatever log is on media
    /// 3. Redo a committed transaction, or undo a pending splice
    /// 4. Reset the log file
    pub fn enable<V: Volume>(volume: &mut V, config: Config) -> Result<Self> {
        config.validate()?;

        let bytes_per_sector = volume.geometry().bytes_per_sector as usize;
        if bytes_per_sector < BASE_SIZE {
            return Err(FatWalError::Config(format!(
                "{} byte sectors cannot hold the {} byte log base",
                bytes_per_sector, BASE_SIZE
            )));
        }

        let (start_cluster, clusters, created) = file::locate_or_create(volume, &config)?;

        let mut log = Self {
            buffer: LogBuffer::new(config.log_capacity)?,
            config,
            state: TransactionState::Idle,
            transaction_count: 0,
            start_cluster,
            clusters,
            bytes_per_sector,
            fat_cache: FatSectorCache::default(),
        };

        let image = log.read_log_file(volume)?;
        match LogFileState::parse(&image, log.config.log_capacity) {
            LogFileState::Committed(buffer) => {
                info!(
                    start_cluster,
                    created,
                    entries = buffer.entry_count(),
                    "Committed log found, replaying"
                );
                log.buffer = buffer;
                log.apply_logs(volume)?;
            }
            LogFileState::Uncommitted(chain) => {
                info!(
                    start_cluster,
                    created,
                    pending_splice = chain.is_valid(),
                    "Uncommitted log found, undoing pending splice"
                );
                log.buffer.reset()?;
                *log.buffer.chain_mut() = chain;
                log.recover(volume)?;
            }
            LogFileState::Absent => {
                info!(start_cluster, created, "No log on media");
            }
        }

        log.reset_log_file(volume)?;
        Ok(log)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open a transaction, or join the one already open
    pub fn transaction_start(&mut self) -> Result<()> {
        self.transaction_count += 1;

        if self.transaction_count == 1 {
            self.buffer.reset()?;
            self.fat_cache.reset();
            self.state = TransactionState::Started;
            debug!("Transaction started");
        }

        Ok(())
    }

    /// Close a transaction; the outermost call commits it
    ///
    /// Commit order:
    /// 1. Seal content then header
    /// 2. Flush the FAT writes of the undo phase
    /// 3. Write the log, sector 0 last
    /// 4. Apply the log to FAT, bitmap and directory sectors
    /// 5. Reset the log file
    ///
    /// A failure after step 3 leaves the log on media for the next
    /// [`TransactionLog::enable`] to replay.
    pub fn transaction_end<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        if self.transaction_count == 0 {
            return Err(FatWalError::TransactionNotStarted);
        }

        self.transaction_count -= 1;
        if self.transaction_count > 0 {
            return Ok(());
        }

        match self.commit(volume) {
            Ok(()) => {
                self.state = TransactionState::Idle;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Commit failed, log left for recovery");
                self.abandon();
                Err(e)
            }
        }
    }

    fn commit<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        if self.buffer.entry_count() == 0 && self.buffer.chain().is_valid() {
            self.restate_splice(volume)?;
        }

        self.buffer.finalize()?;
        debug!(
            entries = self.buffer.entry_count(),
            size = self.buffer.size(),
            "Committing transaction"
        );

        // Undo phase writes are not in the log; they reach media before it commits
        self.fat_cache.flush(volume)?;

        self.write_log_file(volume, file::WriteScope::Full)?;
        self.apply_logs(volume)?;
        self.reset_log_file(volume)
    }

    /// Log one entry for a transaction that only recorded a splice
    ///
    /// Only a log with entries counts as committed on media. Without one, a
    /// power loss during cleanup would undo a splice whose displaced chain
    /// is already partly free.
    fn restate_splice<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        let chain = *self.buffer.chain();
        let geometry = volume.geometry().clone();

        if geometry.is_chain_cluster(chain.insertion_front) {
            let value = volume.read_fat_entry(chain.insertion_front)?;
            self.buffer.add_fat_log(chain.insertion_front, value)?;
        } else if geometry.is_chain_cluster(chain.head_new) {
            let value = volume.read_fat_entry(chain.head_new)?;
            self.buffer.add_fat_log(chain.head_new, value)?;
        } else if chain.bitmap_used() && geometry.is_chain_cluster(chain.head_original) {
            let used = volume.cluster_state_get(chain.head_original)?;
            self.buffer.add_bitmap_log(chain.head_original, u32::from(used))?;
        }

        Ok(())
    }

    /// Abort a transaction; the outermost call undoes the pending splice
    pub fn transaction_fail<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        if self.transaction_count == 0 {
            return Err(FatWalError::TransactionNotStarted);
        }

        self.transaction_count -= 1;
        if self.transaction_count > 0 {
            return Ok(());
        }

        debug!(entries = self.buffer.entry_count(), "Transaction failed, discarding log");

        let result = self.recover(volume).and_then(|()| self.reset_log_file(volume));
        match result {
            Ok(()) => {
                self.state = TransactionState::Idle;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Undo failed, log left for recovery");
                self.abandon();
                Err(e)
            }
        }
    }

    /// Drop the in-memory log without touching media
    fn abandon(&mut self) {
        if let Err(e) = self.buffer.reset() {
            warn!(error = %e, "Failed to reset log buffer");
        }
        self.fat_cache.reset();
        self.transaction_count = 0;
        self.state = TransactionState::Idle;
    }

    // =========================================================================
    // Logging
    // =========================================================================

    fn require_open(&self) -> Result<()> {
        if self.transaction_count == 0 {
            return Err(FatWalError::TransactionNotStarted);
        }
        Ok(())
    }

    pub fn add_fat_log(&mut self, cluster: u32, value: u32) -> Result<()> {
        self.require_open()?;
        self.buffer.add_fat_log(cluster, value)?;
        debug!(cluster, value, "FAT log");
        Ok(())
    }

    pub fn add_bitmap_log(&mut self, cluster: u32, value: u32) -> Result<()> {
        self.require_open()?;
        self.buffer.add_bitmap_log(cluster, value)?;
        debug!(cluster, value, "Bitmap log");
        Ok(())
    }

    pub fn add_dir_log(&mut self, sector: u64, offset: u32, data: &[u8]) -> Result<()> {
        self.require_open()?;
        if offset as usize + data.len() > self.bytes_per_sector {
            return Err(FatWalError::SectorInvalid(format!(
                "{} bytes at offset {} overrun a {} byte sector",
                data.len(),
                offset,
                self.bytes_per_sector
            )));
        }
        self.buffer.add_dir_log(sector, offset, data)?;
        debug!(sector, offset, len = data.len(), "Directory log");
        Ok(())
    }

    pub fn add_checksum_log(&mut self, sector: u64, offset: u32, checksum: u16) -> Result<()> {
        self.require_open()?;
        self.buffer.add_checksum_log(sector, offset, checksum)?;
        debug!(sector, offset, checksum, "Checksum patch");
        Ok(())
    }

    /// Leave the undo phase; later FAT writes are logged again
    ///
    /// The recorded splice stays pending until the transaction ends.
    pub fn end_undo_phase(&mut self) -> Result<()> {
        self.require_open()?;
        if self.state == TransactionState::SetFatChain {
            self.state = TransactionState::Started;
            debug!("Undo phase ended");
        }
        Ok(())
    }

    /// Write a FAT entry around the log, through the one-sector FAT cache
    pub fn write_fat_cached<V: Volume>(&mut self, volume: &mut V, cluster: u32, value: u32) -> Result<()> {
        self.fat_cache.write(volume, cluster, value)
    }

    // =========================================================================
    // Redirected Reads
    // =========================================================================

    /// Latest logged FAT or bitmap value for a cluster
    pub fn read_fat(&self, cluster: u32, kind: LogKind) -> Result<FatLookup> {
        self.buffer.read_fat(cluster, kind)
    }

    /// Overlay logged directory patches onto sectors read from media
    pub fn read_directory_sector(&self, sector: u64, buffer: &mut [u8]) -> Result<()> {
        self.buffer.read_directory_sector(sector, buffer, self.bytes_per_sector)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// A transaction is open
    pub fn is_active(&self) -> bool {
        self.state != TransactionState::Idle
    }

    pub fn transaction_count(&self) -> u32 {
        self.transaction_count
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub fn chain(&self) -> &FatChain {
        self.buffer.chain()
    }

    pub fn start_cluster(&self) -> u32 {
        self.start_cluster
    }

    /// Clusters occupied by the log file, in order
    pub fn log_clusters(&self) -> impl Iterator<Item = u32> {
        self.start_cluster..self.start_cluster + self.clusters
    }

    pub(crate) fn is_log_cluster(&self, cluster: u32) -> bool {
        (self.start_cluster..self.start_cluster + self.clusters).contains(&cluster)
    }
}

// =============================================================================
// FAT Sector Cache
// =============================================================================

/// Tracks which FAT sector the volume's FAT cache is dirtying
///
/// Moving to a different sector flushes the volume FAT cache first, so FAT
/// updates become durable one sector at a time, in write order.
#[derive(Debug, Default)]
pub(crate) struct FatSectorCache {
    sector: Option<u64>,
}

impl FatSectorCache {
    pub(crate) fn write<V: Volume>(&mut self, volume: &mut V, cluster: u32, value: u32) -> Result<()> {
        let sector = volume.geometry().fat_sector(cluster);

        if self.sector.is_some_and(|cached| cached != sector) {
            volume.fat_flush()?;
        }

        volume.write_fat_entry(cluster, value)?;

        // A split FAT12 entry dirtied the next sector as well
        self.sector = if volume.geometry().fat_entry_splits(cluster) {
            volume.fat_flush()?;
            None
        } else {
            Some(sector)
        };

        Ok(())
    }

    pub(crate) fn flush<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        volume.fat_flush()?;
        self.sector = None;
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.sector = None;
    }
}
