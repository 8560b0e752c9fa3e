//! Volume Module
//!
//! The structures the log sits in front of: the FAT, the exFAT allocation
//! bitmap and the logical sector cache. The filesystem provides them; the
//! log only needs the narrow interface in [`Volume`].
//!
//! ## Layout assumed by [`Geometry::new`]
//! ```text
//! ┌────────┬──────────────┬──────────────────┬─────────────────────┐
//! │ Boot   │ FAT          │ Bitmap (exFAT)   │ Data (cluster 2...) │
//! │ (1)    │ (fat_sectors)│ (bitmap_sectors) │                     │
//! └────────┴──────────────┴──────────────────┴─────────────────────┘
//! ```

mod ram;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use ram::RamVolume;

/// First cluster number that can belong to a chain
pub const FAT_ENTRY_START: u32 = 2;

/// Value of an unallocated FAT entry; also "none" in the chain descriptor
pub const FREE_CLUSTER: u32 = 0;

/// FAT variant of the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
}

impl FatType {
    /// Entry values at or above this are markers, not cluster links
    pub fn reserved(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFF0,
            FatType::Fat16 => 0xFFF0,
            FatType::Fat32 => 0x0FFF_FFF0,
            FatType::ExFat => 0xFFFF_FFF7,
        }
    }

    /// End-of-chain marker
    pub fn last(self) -> u32 {
        match self {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
            FatType::ExFat => 0xFFFF_FFFF,
        }
    }

    pub fn is_exfat(self) -> bool {
        self == FatType::ExFat
    }

    /// Byte offset of a cluster's entry from the start of the FAT
    pub fn entry_offset(self, cluster: u32) -> u64 {
        let cluster = cluster as u64;
        match self {
            FatType::Fat12 => cluster + cluster / 2,
            FatType::Fat16 => cluster * 2,
            FatType::Fat32 | FatType::ExFat => cluster * 4,
        }
    }

    /// Bytes an entry touches (FAT12 entries straddle a byte pair)
    pub fn entry_width(self) -> u64 {
        match self {
            FatType::Fat12 | FatType::Fat16 => 2,
            FatType::Fat32 | FatType::ExFat => 4,
        }
    }
}

/// Kind of a cached logical sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorKind {
    Boot,
    Fat,
    Bitmap,
    Directory,
    Data,
}

// =============================================================================
// Geometry
// =============================================================================

/// Volume layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    /// Clusters in the data area; valid numbers are `2..total_clusters + 2`
    pub total_clusters: u32,
    pub fat_start_sector: u64,
    pub fat_sectors: u64,
    pub bitmap_start_sector: u64,
    pub bitmap_sectors: u64,
    pub data_start_sector: u64,
    pub total_sectors: u64,
}

impl Geometry {
    /// Lay out a volume: boot sector, one FAT, the exFAT bitmap, then data
    pub fn new(fat_type: FatType, bytes_per_sector: u32, sectors_per_cluster: u32, total_clusters: u32) -> Self {
        let bps = bytes_per_sector as u64;

        let fat_bytes = fat_type.entry_offset(total_clusters + FAT_ENTRY_START) + fat_type.entry_width();
        let fat_sectors = fat_bytes.div_ceil(bps);

        let bitmap_sectors = if fat_type.is_exfat() {
            (total_clusters as u64).div_ceil(8).div_ceil(bps)
        } else {
            0
        };

        let fat_start_sector = 1;
        let bitmap_start_sector = fat_start_sector + fat_sectors;
        let data_start_sector = bitmap_start_sector + bitmap_sectors;
        let total_sectors = data_start_sector + total_clusters as u64 * sectors_per_cluster as u64;

        Self {
            fat_type,
            bytes_per_sector,
            sectors_per_cluster,
            total_clusters,
            fat_start_sector,
            fat_sectors,
            bitmap_start_sector,
            bitmap_sectors,
            data_start_sector,
            total_sectors,
        }
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// One past the highest cluster number
    pub fn cluster_limit(&self) -> u32 {
        self.total_clusters + FAT_ENTRY_START
    }

    /// A value that can be followed as a link inside this volume
    pub fn is_chain_cluster(&self, cluster: u32) -> bool {
        cluster >= FAT_ENTRY_START
            && cluster < self.fat_type.reserved()
            && cluster < self.cluster_limit()
    }

    /// First logical sector of a cluster
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.data_start_sector + (cluster - FAT_ENTRY_START) as u64 * self.sectors_per_cluster as u64
    }

    /// Logical sector holding the (first byte of the) cluster's FAT entry
    pub fn fat_sector(&self, cluster: u32) -> u64 {
        self.fat_start_sector + self.fat_type.entry_offset(cluster) / self.bytes_per_sector as u64
    }

    /// The cluster's FAT entry spans two sectors (FAT12 only)
    pub fn fat_entry_splits(&self, cluster: u32) -> bool {
        self.fat_type == FatType::Fat12
            && self.fat_type.entry_offset(cluster) % self.bytes_per_sector as u64
                == self.bytes_per_sector as u64 - 1
    }
}

// =============================================================================
// Volume Trait
// =============================================================================

/// Structural access the log needs from the filesystem
///
/// Writes may land in a cache; the flush calls make them durable.
pub trait Volume {
    fn geometry(&self) -> &Geometry;

    fn read_fat_entry(&mut self, cluster: u32) -> Result<u32>;

    fn write_fat_entry(&mut self, cluster: u32, value: u32) -> Result<()>;

    /// Read `buffer.len() / bytes_per_sector` sectors starting at `sector`
    fn read_sectors(&mut self, sector: u64, buffer: &mut [u8]) -> Result<()>;

    /// Write whole sectors starting at `sector`
    fn write_sectors(&mut self, sector: u64, buffer: &[u8], kind: SectorKind) -> Result<()>;

    /// exFAT allocation bitmap: true when the cluster is in use
    fn cluster_state_get(&mut self, cluster: u32) -> Result<bool>;

    fn cluster_state_set(&mut self, cluster: u32, used: bool) -> Result<()>;

    fn fat_flush(&mut self) -> Result<()>;

    fn bitmap_flush(&mut self) -> Result<()>;

    /// Flush cached sectors other than FAT and bitmap sectors
    fn sector_cache_flush(&mut self) -> Result<()>;
}
