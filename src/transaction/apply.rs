//! Log replay
//!
//! Writes every logged change to the structure it targets, in log order,
//! then frees the displaced chain and flushes. Replaying a log twice gives
//! the same result as replaying it once.

use tracing::debug;

use crate::error::{FatWalError, Result};
use crate::log::LogEntry;
use crate::volume::{SectorKind, Volume};

use super::chain::CleanupMode;
use super::TransactionLog;

impl TransactionLog {
    /// Replay the log against the FAT, bitmap and directory sectors
    pub(crate) fn apply_logs<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        let geometry = volume.geometry().clone();
        let bps = geometry.bytes_per_sector as usize;
        let mut applied = 0u32;

        let Self { buffer, fat_cache, .. } = self;

        for item in buffer.entries() {
            let (_, entry) = item?;

            match entry {
                LogEntry::Fat { cluster, value } => {
                    fat_cache.write(volume, cluster, value)?;
                }
                LogEntry::Bitmap { cluster, value } => {
                    volume.cluster_state_set(cluster, value != 0)?;
                }
                LogEntry::Directory { sector, offset, data } => {
                    if sector >= geometry.total_sectors {
                        return Err(FatWalError::SectorInvalid(format!(
                            "directory log targets sector {} of {}",
                            sector, geometry.total_sectors
                        )));
                    }

                    let offset = offset as usize;
                    if offset + data.len() > bps {
                        return Err(FatWalError::FileCorrupt(format!(
                            "directory log at offset {} with {} bytes overruns the sector",
                            offset,
                            data.len()
                        )));
                    }

                    let mut sector_data = vec![0u8; bps];
                    volume.read_sectors(sector, &mut sector_data)?;
                    sector_data[offset..offset + data.len()].copy_from_slice(data);
                    volume.write_sectors(sector, &sector_data, SectorKind::Directory)?;
                }
                LogEntry::Unknown { kind, size } => {
                    return Err(FatWalError::SectorInvalid(format!(
                        "unknown log entry type {} ({} bytes)",
                        kind, size
                    )));
                }
            }

            applied += 1;
        }

        if self.buffer.chain().is_valid() {
            self.cleanup_fat_chain(volume, CleanupMode::Cleanup)?;
        }

        volume.sector_cache_flush()?;
        self.fat_cache.flush(volume)?;
        if geometry.fat_type.is_exfat() {
            volume.bitmap_flush()?;
        }

        debug!(applied, "Log applied");
        Ok(())
    }
}
