//! RAM volume
//!
//! A byte-accurate volume held in memory. FAT entries are packed exactly as
//! on a real FAT12/16/32/exFAT volume, and all writes go through a write-back
//! sector cache, so the durable contents only change on a flush.
//!
//! Power loss can be injected: after a chosen number of durable sector
//! writes every further durable write fails and is lost. `power_cycle`
//! then drops the cache, as a reboot would.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{FatWalError, Result};

use super::{FatType, Geometry, SectorKind, Volume, FAT_ENTRY_START, FREE_CLUSTER};

/// Magic bytes at the front of a saved image
const IMAGE_MAGIC: &[u8; 4] = b"FWIM";

#[derive(Debug, Clone)]
struct CachedSector {
    kind: SectorKind,
    data: Vec<u8>,
}

/// In-memory volume with a write-back cache and power-loss injection
#[derive(Debug, Clone)]
pub struct RamVolume {
    geometry: Geometry,
    /// Durable contents
    media: Vec<u8>,
    /// Dirty sectors, not yet durable
    cache: BTreeMap<u64, CachedSector>,
    durable_writes: u64,
    /// Durable write count at which power is lost
    crash_at: Option<u64>,
    crashed: bool,
}

impl RamVolume {
    /// Create a zeroed volume (every cluster free)
    pub fn new(fat_type: FatType, bytes_per_sector: u32, sectors_per_cluster: u32, total_clusters: u32) -> Result<Self> {
        if !bytes_per_sector.is_power_of_two() || bytes_per_sector < 64 {
            return Err(FatWalError::Config(format!(
                "unsupported sector size {}",
                bytes_per_sector
            )));
        }

        if sectors_per_cluster == 0 || total_clusters == 0 {
            return Err(FatWalError::Config(
                "volume needs at least one cluster of one sector".to_string(),
            ));
        }

        if total_clusters + FAT_ENTRY_START > fat_type.reserved() {
            return Err(FatWalError::Config(format!(
                "{} clusters do not fit a {:?} volume",
                total_clusters, fat_type
            )));
        }

        let geometry = Geometry::new(fat_type, bytes_per_sector, sectors_per_cluster, total_clusters);
        Ok(Self::with_geometry(geometry))
    }

    fn with_geometry(geometry: Geometry) -> Self {
        let media = vec![0u8; (geometry.total_sectors * geometry.bytes_per_sector as u64) as usize];
        Self {
            geometry,
            media,
            cache: BTreeMap::new(),
            durable_writes: 0,
            crash_at: None,
            crashed: false,
        }
    }

    // =========================================================================
    // Power Loss Simulation
    // =========================================================================

    /// Lose power after `writes` more durable sector writes
    pub fn crash_after_writes(&mut self, writes: u64) {
        self.crash_at = Some(self.durable_writes + writes);
    }

    /// Reboot: drop everything that was not durable and restore power
    pub fn power_cycle(&mut self) {
        debug!(dropped = self.cache.len(), "RAM volume power cycle");
        self.cache.clear();
        self.crash_at = None;
        self.crashed = false;
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// Number of sector writes that reached media
    pub fn durable_writes(&self) -> u64 {
        self.durable_writes
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Link `clusters` into a chain ending in end-of-chain, mark them used,
    /// and flush
    pub fn link_chain(&mut self, clusters: &[u32]) -> Result<()> {
        let last = self.geometry.fat_type.last();
        for (i, &cluster) in clusters.iter().enumerate() {
            let next = clusters.get(i + 1).copied().unwrap_or(last);
            self.write_fat_entry(cluster, next)?;
            if self.geometry.fat_type.is_exfat() {
                self.cluster_state_set(cluster, true)?;
            }
        }
        self.fat_flush()?;
        self.bitmap_flush()
    }

    /// Clusters whose FAT entry is not free
    pub fn allocated_clusters(&mut self) -> Result<Vec<u32>> {
        let mut allocated = Vec::new();
        for cluster in FAT_ENTRY_START..self.geometry.cluster_limit() {
            if self.read_fat_entry(cluster)? != FREE_CLUSTER {
                allocated.push(cluster);
            }
        }
        Ok(allocated)
    }

    /// Clusters marked in use in the exFAT bitmap
    pub fn bitmap_used_clusters(&mut self) -> Result<Vec<u32>> {
        let mut used = Vec::new();
        if !self.geometry.fat_type.is_exfat() {
            return Ok(used);
        }
        for cluster in FAT_ENTRY_START..self.geometry.cluster_limit() {
            if self.cluster_state_get(cluster)? {
                used.push(cluster);
            }
        }
        Ok(used)
    }

    // =========================================================================
    // Image Files
    // =========================================================================

    /// Write the durable contents to an image file
    ///
    /// Cached sectors are not included, just as they would not survive a
    /// power cut.
    pub fn save(&self, path: &Path) -> Result<()> {
        let geometry = bincode::serialize(&self.geometry)?;

        let mut file = File::create(path)?;
        file.write_all(IMAGE_MAGIC)?;
        file.write_all(&(geometry.len() as u32).to_le_bytes())?;
        file.write_all(&geometry)?;
        file.write_all(&self.media)?;
        file.sync_all()?;
        Ok(())
    }

    /// Load an image written by [`RamVolume::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        if bytes.len() < 8 || &bytes[0..4] != IMAGE_MAGIC {
            return Err(FatWalError::Config(format!(
                "{} is not a volume image",
                path.display()
            )));
        }

        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if bytes.len() < 8 + len {
            return Err(FatWalError::Config("image geometry truncated".to_string()));
        }
        let geometry: Geometry = bincode::deserialize(&bytes[8..8 + len])?;

        let mut volume = Self::with_geometry(geometry);
        let media = &bytes[8 + len..];
        if media.len() != volume.media.len() {
            return Err(FatWalError::Config(format!(
                "image holds {} media bytes, geometry needs {}",
                media.len(),
                volume.media.len()
            )));
        }
        volume.media.copy_from_slice(media);
        Ok(volume)
    }

    // =========================================================================
    // Sector Plumbing
    // =========================================================================

    fn bps(&self) -> usize {
        self.geometry.bytes_per_sector as usize
    }

    fn check_sector(&self, sector: u64) -> Result<()> {
        if sector >= self.geometry.total_sectors {
            return Err(FatWalError::SectorInvalid(format!(
                "sector {} beyond volume of {} sectors",
                sector, self.geometry.total_sectors
            )));
        }
        Ok(())
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster >= self.geometry.cluster_limit() {
            return Err(FatWalError::SectorInvalid(format!(
                "cluster {} beyond volume",
                cluster
            )));
        }
        Ok(())
    }

    fn sector_data(&self, sector: u64) -> &[u8] {
        match self.cache.get(&sector) {
            Some(cached) => &cached.data,
            None => {
                let start = sector as usize * self.bps();
                &self.media[start..start + self.bps()]
            }
        }
    }

    fn sector_data_mut(&mut self, sector: u64, kind: SectorKind) -> &mut Vec<u8> {
        let bps = self.bps();
        let start = sector as usize * bps;
        let media = &self.media;
        let cached = self.cache.entry(sector).or_insert_with(|| CachedSector {
            kind,
            data: media[start..start + bps].to_vec(),
        });
        cached.kind = kind;
        &mut cached.data
    }

    /// Read bytes at an absolute volume offset through the cache
    fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        let bps = self.bps() as u64;
        for (i, byte) in out.iter_mut().enumerate() {
            let at = offset + i as u64;
            *byte = self.sector_data(at / bps)[(at % bps) as usize];
        }
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8], kind: SectorKind) {
        let bps = self.bps() as u64;
        for (i, byte) in data.iter().enumerate() {
            let at = offset + i as u64;
            self.sector_data_mut(at / bps, kind)[(at % bps) as usize] = *byte;
        }
    }

    /// Copy one sector to media, honouring an injected power loss
    fn persist(&mut self, sector: u64, data: &[u8]) -> Result<()> {
        if self.crashed || self.crash_at.is_some_and(|at| self.durable_writes >= at) {
            self.crashed = true;
            return Err(FatWalError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated power loss writing sector {}", sector),
            )));
        }

        let start = sector as usize * self.bps();
        self.media[start..start + data.len()].copy_from_slice(data);
        self.durable_writes += 1;
        Ok(())
    }

    fn flush_where(&mut self, keep: impl Fn(SectorKind) -> bool) -> Result<()> {
        let sectors: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, cached)| keep(cached.kind))
            .map(|(&sector, _)| sector)
            .collect();

        for sector in sectors {
            if let Some(cached) = self.cache.get(&sector) {
                let data = cached.data.clone();
                self.persist(sector, &data)?;
                self.cache.remove(&sector);
            }
        }
        Ok(())
    }

    fn fat_entry_position(&self, cluster: u32) -> u64 {
        self.geometry.fat_start_sector * self.bps() as u64 + self.geometry.fat_type.entry_offset(cluster)
    }

    fn bitmap_position(&self, cluster: u32) -> (u64, u8) {
        let index = (cluster - FAT_ENTRY_START) as u64;
        let offset = self.geometry.bitmap_start_sector * self.bps() as u64 + index / 8;
        (offset, 1u8 << (index % 8))
    }
}

impl Volume for RamVolume {
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn read_fat_entry(&mut self, cluster: u32) -> Result<u32> {
        self.check_cluster(cluster)?;
        let position = self.fat_entry_position(cluster);

        let value = match self.geometry.fat_type {
            FatType::Fat12 => {
                let mut raw = [0u8; 2];
                self.read_bytes(position, &mut raw);
                let pair = u16::from_le_bytes(raw) as u32;
                if cluster & 1 == 1 {
                    pair >> 4
                } else {
                    pair & 0x0FFF
                }
            }
            FatType::Fat16 => {
                let mut raw = [0u8; 2];
                self.read_bytes(position, &mut raw);
                u16::from_le_bytes(raw) as u32
            }
            FatType::Fat32 => {
                let mut raw = [0u8; 4];
                self.read_bytes(position, &mut raw);
                u32::from_le_bytes(raw) & 0x0FFF_FFFF
            }
            FatType::ExFat => {
                let mut raw = [0u8; 4];
                self.read_bytes(position, &mut raw);
                u32::from_le_bytes(raw)
            }
        };

        Ok(value)
    }

    fn write_fat_entry(&mut self, cluster: u32, value: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        let position = self.fat_entry_position(cluster);

        match self.geometry.fat_type {
            FatType::Fat12 => {
                let mut raw = [0u8; 2];
                self.read_bytes(position, &mut raw);
                let pair = u16::from_le_bytes(raw);
                let value = (value & 0x0FFF) as u16;
                let pair = if cluster & 1 == 1 {
                    (pair & 0x000F) | (value << 4)
                } else {
                    (pair & 0xF000) | value
                };
                self.write_bytes(position, &pair.to_le_bytes(), SectorKind::Fat);
            }
            FatType::Fat16 => {
                self.write_bytes(position, &(value as u16).to_le_bytes(), SectorKind::Fat);
            }
            FatType::Fat32 => {
                let mut raw = [0u8; 4];
                self.read_bytes(position, &mut raw);
                let kept = u32::from_le_bytes(raw) & 0xF000_0000;
                let value = kept | (value & 0x0FFF_FFFF);
                self.write_bytes(position, &value.to_le_bytes(), SectorKind::Fat);
            }
            FatType::ExFat => {
                self.write_bytes(position, &value.to_le_bytes(), SectorKind::Fat);
            }
        }

        Ok(())
    }

    fn read_sectors(&mut self, sector: u64, buffer: &mut [u8]) -> Result<()> {
        let bps = self.bps();
        for (i, chunk) in buffer.chunks_mut(bps).enumerate() {
            let current = sector + i as u64;
            self.check_sector(current)?;
            let len = chunk.len();
            chunk.copy_from_slice(&self.sector_data(current)[..len]);
        }
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buffer: &[u8], kind: SectorKind) -> Result<()> {
        let bps = self.bps();
        for (i, chunk) in buffer.chunks(bps).enumerate() {
            let current = sector + i as u64;
            self.check_sector(current)?;
            self.sector_data_mut(current, kind)[..chunk.len()].copy_from_slice(chunk);
        }
        Ok(())
    }

    fn cluster_state_get(&mut self, cluster: u32) -> Result<bool> {
        self.check_cluster(cluster)?;
        if !self.geometry.fat_type.is_exfat() || cluster < FAT_ENTRY_START {
            return Ok(false);
        }
        let (offset, mask) = self.bitmap_position(cluster);
        let mut byte = [0u8; 1];
        self.read_bytes(offset, &mut byte);
        Ok(byte[0] & mask != 0)
    }

    fn cluster_state_set(&mut self, cluster: u32, used: bool) -> Result<()> {
        self.check_cluster(cluster)?;
        if !self.geometry.fat_type.is_exfat() || cluster < FAT_ENTRY_START {
            return Ok(());
        }
        let (offset, mask) = self.bitmap_position(cluster);
        let mut byte = [0u8; 1];
        self.read_bytes(offset, &mut byte);
        let updated = if used { byte[0] | mask } else { byte[0] & !mask };
        self.write_bytes(offset, &[updated], SectorKind::Bitmap);
        Ok(())
    }

    fn fat_flush(&mut self) -> Result<()> {
        self.flush_where(|kind| kind == SectorKind::Fat)
    }

    fn bitmap_flush(&mut self) -> Result<()> {
        self.flush_where(|kind| kind == SectorKind::Bitmap)
    }

    fn sector_cache_flush(&mut self) -> Result<()> {
        self.flush_where(|kind| kind != SectorKind::Fat && kind != SectorKind::Bitmap)
    }
}
