//! Log file I/O
//!
//! The log lives in a run of consecutive clusters recorded in the boot
//! sector. Writes that span several sectors put sector 0, which carries the
//! header and total size, on media last.

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{FatWalError, Result};
use crate::log::{FatChain, LogBuffer, LogHeader, BASE_SIZE, CHAIN_OFFSET, CHAIN_SIZE, HEADER_SIZE};
use crate::volume::{SectorKind, Volume, FAT_ENTRY_START, FREE_CLUSTER};

use super::TransactionLog;

/// How much of the log image to write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteScope {
    /// Header, chain and the first entries only
    Sector0,
    /// Every sector the log occupies
    Full,
}

/// What a log image read off media holds
#[derive(Debug)]
pub enum LogFileState {
    /// No usable header: nothing to redo or undo
    Absent,
    /// Header and chain intact but no committed entries; only the chain counts
    Uncommitted(FatChain),
    /// A transaction that reached media in full and must be applied
    Committed(LogBuffer),
}

impl LogFileState {
    /// Classify a raw log image
    ///
    /// The header must carry the log ID, the current version, a valid
    /// checksum and a size within `[BASE_SIZE, capacity]`, and the chain
    /// checksum must hold. The log is committed when the content checksum
    /// also holds and at least one entry was logged.
    pub fn parse(image: &[u8], capacity: usize) -> Self {
        if image.len() < BASE_SIZE {
            return LogFileState::Absent;
        }

        let header = match LogHeader::decode(&image[..HEADER_SIZE]) {
            Ok(header) => header,
            Err(_) => return LogFileState::Absent,
        };

        if !matches!(header.is_valid(), Ok(true)) {
            return LogFileState::Absent;
        }

        let total = header.total_size as usize;
        if total < BASE_SIZE || total > capacity || total > image.len() {
            warn!(total, capacity, "Log header reports an impossible size");
            return LogFileState::Absent;
        }

        let chain = match FatChain::decode(&image[CHAIN_OFFSET..CHAIN_OFFSET + CHAIN_SIZE]) {
            Ok(chain) => chain,
            Err(_) => return LogFileState::Absent,
        };

        if !matches!(chain.checksum_ok(), Ok(true)) {
            warn!("Log chain checksum mismatch, ignoring log");
            return LogFileState::Absent;
        }

        let buffer = match LogBuffer::from_image(image, capacity) {
            Ok(buffer) => buffer,
            Err(e) => {
                debug!(error = %e, "Log entries unreadable, treating as uncommitted");
                return LogFileState::Uncommitted(chain);
            }
        };

        let committed = matches!(buffer.content_checksum_ok(), Ok(true))
            && buffer.content().count > 0
            && u32::from(buffer.content().count) == buffer.entry_count();

        if committed {
            LogFileState::Committed(buffer)
        } else {
            LogFileState::Uncommitted(chain)
        }
    }
}

// =============================================================================
// Location
// =============================================================================

/// Find the log file through the boot sector, or allocate and record one
///
/// Returns `(start_cluster, clusters, created)`.
pub(crate) fn locate_or_create<V: Volume>(volume: &mut V, config: &Config) -> Result<(u32, u32, bool)> {
    let geometry = volume.geometry().clone();
    let clusters = u32::try_from((config.log_capacity as u64).div_ceil(geometry.bytes_per_cluster()))
        .map_err(|_| FatWalError::Config("log file needs too many clusters".to_string()))?;

    let bps = geometry.bytes_per_sector as usize;
    if config.boot_index + 4 > bps {
        return Err(FatWalError::Config(format!(
            "boot index {} outside a {} byte boot sector",
            config.boot_index, bps
        )));
    }

    let mut boot = vec![0u8; bps];
    volume.read_sectors(0, &mut boot)?;

    if let Some(start) = recorded_start(volume, &boot, config.boot_index, clusters)? {
        return Ok((start, clusters, false));
    }

    let start = find_free_run(volume, clusters)?;
    let last = geometry.fat_type.last();

    for cluster in start..start + clusters {
        let next = if cluster + 1 == start + clusters { last } else { cluster + 1 };
        volume.write_fat_entry(cluster, next)?;
        if geometry.fat_type.is_exfat() {
            volume.cluster_state_set(cluster, true)?;
        }
    }
    volume.fat_flush()?;
    if geometry.fat_type.is_exfat() {
        volume.bitmap_flush()?;
    }

    boot[config.boot_index..config.boot_index + 4].copy_from_slice(&start.to_le_bytes());
    volume.write_sectors(0, &boot, SectorKind::Boot)?;
    volume.sector_cache_flush()?;

    info!(start, clusters, "Allocated log file");
    Ok((start, clusters, true))
}

fn recorded_start<V: Volume>(volume: &mut V, boot: &[u8], boot_index: usize, clusters: u32) -> Result<Option<u32>> {
    let field = &boot[boot_index..boot_index + 4];
    let start = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);

    let geometry = volume.geometry().clone();
    if clusters == 0 || !geometry.is_chain_cluster(start) || start + clusters > geometry.cluster_limit() {
        return Ok(None);
    }

    let end = start + clusters - 1;

    // The whole run must still be linked end to end
    for cluster in start..=end {
        let next = volume.read_fat_entry(cluster)?;
        let linked = if cluster == end {
            next != FREE_CLUSTER && !geometry.is_chain_cluster(next)
        } else {
            next == cluster + 1
        };

        if !linked || (geometry.fat_type.is_exfat() && !volume.cluster_state_get(cluster)?) {
            warn!(start, cluster, next, "Recorded log file is no longer allocated, reallocating");
            return Ok(None);
        }
    }

    Ok(Some(start))
}

fn find_free_run<V: Volume>(volume: &mut V, clusters: u32) -> Result<u32> {
    let limit = volume.geometry().cluster_limit();
    let exfat = volume.geometry().fat_type.is_exfat();

    let mut run_start = FAT_ENTRY_START;
    let mut run_len = 0;

    for cluster in FAT_ENTRY_START..limit {
        let free = volume.read_fat_entry(cluster)? == FREE_CLUSTER
            && !(exfat && volume.cluster_state_get(cluster)?);

        if !free {
            run_len = 0;
            run_start = cluster + 1;
            continue;
        }

        run_len += 1;
        if run_len == clusters {
            return Ok(run_start);
        }
    }

    Err(FatWalError::Config(format!(
        "no run of {} free clusters for the log file",
        clusters
    )))
}

// =============================================================================
// Reading and Writing
// =============================================================================

impl TransactionLog {
    fn first_sector<V: Volume>(&self, volume: &V) -> u64 {
        volume.geometry().cluster_to_sector(self.start_cluster)
    }

    fn log_sectors(&self) -> usize {
        self.config.log_capacity.div_ceil(self.bytes_per_sector)
    }

    /// Read the raw log file, `log_capacity` bytes rounded up to whole sectors
    pub(crate) fn read_log_file<V: Volume>(&self, volume: &mut V) -> Result<Vec<u8>> {
        let mut image = vec![0u8; self.log_sectors() * self.bytes_per_sector];
        let first = self.first_sector(volume);
        volume.read_sectors(first, &mut image)?;
        Ok(image)
    }

    /// Put the in-memory log on media
    pub(crate) fn write_log_file<V: Volume>(&self, volume: &mut V, scope: WriteScope) -> Result<()> {
        let bps = self.bytes_per_sector;
        let mut image = self.buffer.image()?;
        image.resize(image.len().div_ceil(bps) * bps, 0);

        let first = self.first_sector(volume);

        if scope == WriteScope::Full && image.len() > bps {
            volume.write_sectors(first + 1, &image[bps..], SectorKind::Data)?;
            volume.sector_cache_flush()?;
        }

        volume.write_sectors(first, &image[..bps], SectorKind::Data)?;
        volume.sector_cache_flush()
    }

    /// Empty the log in memory and on media
    pub(crate) fn reset_log_file<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        self.buffer.reset()?;
        self.write_log_file(volume, WriteScope::Sector0)
    }

    /// Read the log file of a volume without enabling it
    ///
    /// Returns `None` when the boot sector records no log cluster.
    pub fn read_image<V: Volume>(volume: &mut V, config: &Config) -> Result<Option<Vec<u8>>> {
        config.validate()?;

        let geometry = volume.geometry().clone();
        let bps = geometry.bytes_per_sector as usize;
        if config.boot_index + 4 > bps {
            return Err(FatWalError::Config(format!(
                "boot index {} outside a {} byte boot sector",
                config.boot_index, bps
            )));
        }

        let clusters = u32::try_from((config.log_capacity as u64).div_ceil(geometry.bytes_per_cluster()))
            .map_err(|_| FatWalError::Config("log file needs too many clusters".to_string()))?;

        let mut boot = vec![0u8; bps];
        volume.read_sectors(0, &mut boot)?;

        let start = match recorded_start(volume, &boot, config.boot_index, clusters)? {
            Some(start) => start,
            None => return Ok(None),
        };

        let mut image = vec![0u8; config.log_capacity.div_ceil(bps) * bps];
        volume.read_sectors(geometry.cluster_to_sector(start), &mut image)?;
        Ok(Some(image))
    }
}
