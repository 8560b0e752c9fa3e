//! Media Module
//!
//! The filesystem's view of a volume. Every structural read and write goes
//! through [`Media`], which sends it to the log or to the volume depending on
//! the transaction state.
//!
//! ## Routing
//! ```text
//!                      │ no log / IDLE │ STARTED        │ SET_FAT_CHAIN
//!   ───────────────────┼───────────────┼────────────────┼────────────────
//!   FAT write          │ volume        │ FAT log        │ volume (cached)
//!   bitmap write       │ volume        │ bitmap log     │ bitmap log
//!   directory write    │ volume        │ directory log  │ directory log
//!   set checksum       │ volume        │ checksum patch │ checksum patch
//!   FAT / bitmap read  │ volume        │ log, then volume
//!   directory read     │ volume        │ volume + logged patches
//! ```
//!
//! SET_FAT_CHAIN lasts from [`Media::set_fat_chain`] to
//! [`Media::end_undo_phase`]. Its FAT writes reach media unlogged and are
//! undone from the recorded splice if the transaction does not commit.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::config::Config;
use crate::error::{FatWalError, Result};
use crate::log::{FatLookup, LogKind};
use crate::transaction::{TransactionLog, TransactionState};
use crate::volume::{SectorKind, Volume};

/// A volume with optional fault tolerance
pub struct Media<V: Volume> {
    volume: V,
    log: Option<TransactionLog>,
}

impl<V: Volume> Media<V> {
    /// Wrap a volume; fault tolerance starts disabled
    pub fn new(volume: V) -> Self {
        Self { volume, log: None }
    }

    /// Enable fault tolerance, replaying or undoing any log left on media
    pub fn enable(&mut self, config: Config) -> Result<()> {
        let log = TransactionLog::enable(&mut self.volume, config)?;
        self.log = Some(log);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.log.is_some()
    }

    pub fn log(&self) -> Option<&TransactionLog> {
        self.log.as_ref()
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    /// Direct access to the volume, bypassing the log
    pub fn volume_mut(&mut self) -> &mut V {
        &mut self.volume
    }

    pub fn into_volume(self) -> V {
        self.volume
    }

    fn active_log(&mut self) -> Option<&mut TransactionLog> {
        self.log.as_mut().filter(|log| log.is_active())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Without fault tolerance the transaction calls do nothing
    pub fn transaction_start(&mut self) -> Result<()> {
        match &mut self.log {
            Some(log) => log.transaction_start(),
            None => Ok(()),
        }
    }

    pub fn transaction_end(&mut self) -> Result<()> {
        match &mut self.log {
            Some(log) => log.transaction_end(&mut self.volume),
            None => Ok(()),
        }
    }

    pub fn transaction_fail(&mut self) -> Result<()> {
        match &mut self.log {
            Some(log) => log.transaction_fail(&mut self.volume),
            None => Ok(()),
        }
    }

    /// Run `f` inside a transaction
    ///
    /// Commits when `f` succeeds. When `f` fails the transaction is failed
    /// and `f`'s error is returned.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.transaction_start()?;

        match f(self) {
            Ok(value) => {
                self.transaction_end()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(fail) = self.transaction_fail() {
                    warn!(error = %fail, "Failed to undo transaction");
                }
                Err(e)
            }
        }
    }

    /// Record the pending splice of the current transaction
    pub fn set_fat_chain(
        &mut self,
        use_bitmap: bool,
        insertion_front: u32,
        new_head: u32,
        original_head: u32,
        insertion_back: u32,
    ) -> Result<()> {
        let log = self.log.as_mut().ok_or(FatWalError::NotEnabled)?;
        log.set_fat_chain(
            &mut self.volume,
            use_bitmap,
            insertion_front,
            new_head,
            original_head,
            insertion_back,
        )
    }

    /// Log FAT writes again after linking the spliced chain
    pub fn end_undo_phase(&mut self) -> Result<()> {
        let log = self.log.as_mut().ok_or(FatWalError::NotEnabled)?;
        log.end_undo_phase()
    }

    // =========================================================================
    // FAT and Bitmap
    // =========================================================================

    pub fn read_fat_entry(&mut self, cluster: u32) -> Result<u32> {
        if let Some(log) = self.active_log() {
            if let FatLookup::Logged(value) = log.read_fat(cluster, LogKind::Fat)? {
                return Ok(value);
            }
        }
        self.volume.read_fat_entry(cluster)
    }

    pub fn write_fat_entry(&mut self, cluster: u32, value: u32) -> Result<()> {
        match &mut self.log {
            Some(log) if log.state() == TransactionState::Started => log.add_fat_log(cluster, value),
            Some(log) if log.state() == TransactionState::SetFatChain => {
                log.write_fat_cached(&mut self.volume, cluster, value)
            }
            _ => self.volume.write_fat_entry(cluster, value),
        }
    }

    pub fn cluster_state_get(&mut self, cluster: u32) -> Result<bool> {
        if let Some(log) = self.active_log() {
            if let FatLookup::Logged(value) = log.read_fat(cluster, LogKind::Bitmap)? {
                return Ok(value != 0);
            }
        }
        self.volume.cluster_state_get(cluster)
    }

    pub fn cluster_state_set(&mut self, cluster: u32, used: bool) -> Result<()> {
        match self.active_log() {
            Some(log) => log.add_bitmap_log(cluster, u32::from(used)),
            None => self.volume.cluster_state_set(cluster, used),
        }
    }

    // =========================================================================
    // Sectors
    // =========================================================================

    /// Read sectors, with logged directory patches laid over them
    pub fn read_sectors(&mut self, sector: u64, buffer: &mut [u8]) -> Result<()> {
        self.volume.read_sectors(sector, buffer)?;
        if let Some(log) = self.active_log() {
            log.read_directory_sector(sector, buffer)?;
        }
        Ok(())
    }

    /// Overwrite `data.len()` bytes of a directory sector at `offset`
    pub fn write_directory(&mut self, sector: u64, offset: u32, data: &[u8]) -> Result<()> {
        if let Some(log) = self.active_log() {
            return log.add_dir_log(sector, offset, data);
        }
        self.patch_sector(sector, offset as usize, data)
    }

    /// Update the SetChecksum field of an exFAT entry set
    ///
    /// `offset` addresses the field itself, two bytes into the primary entry.
    pub fn write_entry_set_checksum(&mut self, sector: u64, offset: u32, checksum: u16) -> Result<()> {
        if let Some(log) = self.active_log() {
            return log.add_checksum_log(sector, offset, checksum);
        }
        self.patch_sector(sector, offset as usize, &checksum.to_le_bytes())
    }

    fn patch_sector(&mut self, sector: u64, offset: usize, data: &[u8]) -> Result<()> {
        let bps = self.volume.geometry().bytes_per_sector as usize;
        if offset + data.len() > bps {
            return Err(FatWalError::SectorInvalid(format!(
                "{} bytes at offset {} overrun a {} byte sector",
                data.len(),
                offset,
                bps
            )));
        }

        let mut sector_data = vec![0u8; bps];
        self.volume.read_sectors(sector, &mut sector_data)?;
        sector_data[offset..offset + data.len()].copy_from_slice(data);
        self.volume.write_sectors(sector, &sector_data, SectorKind::Directory)
    }

    /// Flush every volume cache: sectors, FAT, then bitmap
    pub fn flush(&mut self) -> Result<()> {
        self.volume.sector_cache_flush()?;
        self.volume.fat_flush()?;
        self.volume.bitmap_flush()
    }
}

// =============================================================================
// Shared Access
// =============================================================================

/// A [`Media`] behind the media mutex
///
/// Clones share the volume. Whoever holds the lock owns the transaction.
pub struct SharedMedia<V: Volume> {
    inner: Arc<Mutex<Media<V>>>,
}

impl<V: Volume> Clone for SharedMedia<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Volume> SharedMedia<V> {
    pub fn new(media: Media<V>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(media)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Media<V>> {
        self.inner.lock()
    }

    /// Run `f` as one transaction while holding the media mutex
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Media<V>) -> Result<T>,
    {
        let mut media = self.inner.lock();
        media.transaction(f)
    }
}
