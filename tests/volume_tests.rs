//! Tests for RamVolume
//!
//! These tests verify:
//! - FAT entry packing for every FAT variant
//! - FAT12 entries that span two sectors
//! - Writes only become durable on flush
//! - Power loss injection and power cycling
//! - Image save/load round trip

use fatwal::volume::{FatType, Geometry, RamVolume, SectorKind, Volume, FREE_CLUSTER};
use fatwal::FatWalError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn volume(fat_type: FatType) -> RamVolume {
    RamVolume::new(fat_type, 512, 1, 400).unwrap()
}

// =============================================================================
// Geometry Tests
// =============================================================================

#[test]
fn test_geometry_layout() {
    let geometry = Geometry::new(FatType::Fat16, 512, 2, 1000);

    assert_eq!(geometry.fat_start_sector, 1);
    // 1002 entries of 2 bytes, plus the width of the last one
    assert_eq!(geometry.fat_sectors, 4);
    assert_eq!(geometry.bitmap_sectors, 0);
    assert_eq!(geometry.data_start_sector, 5);
    assert_eq!(geometry.cluster_to_sector(2), 5);
    assert_eq!(geometry.cluster_to_sector(3), 7);
    assert_eq!(geometry.total_sectors, 5 + 2000);
}

#[test]
fn test_exfat_geometry_has_bitmap() {
    let geometry = Geometry::new(FatType::ExFat, 512, 1, 8000);

    assert_eq!(geometry.bitmap_start_sector, 1 + geometry.fat_sectors);
    assert_eq!(geometry.bitmap_sectors, 2);
    assert_eq!(geometry.data_start_sector, geometry.bitmap_start_sector + 2);
}

#[test]
fn test_chain_cluster_bounds() {
    let geometry = Geometry::new(FatType::Fat12, 512, 1, 100);

    assert!(!geometry.is_chain_cluster(0));
    assert!(!geometry.is_chain_cluster(1));
    assert!(geometry.is_chain_cluster(2));
    assert!(geometry.is_chain_cluster(101));
    assert!(!geometry.is_chain_cluster(102));
    assert!(!geometry.is_chain_cluster(FatType::Fat12.last()));
}

#[test]
fn test_fat12_split_detection() {
    let geometry = Geometry::new(FatType::Fat12, 512, 1, 1000);

    // Cluster 341 starts at byte 511 of the FAT
    assert!(geometry.fat_entry_splits(341));
    assert!(!geometry.fat_entry_splits(340));
    assert!(!geometry.fat_entry_splits(342));
    assert_eq!(geometry.fat_sector(341), 1);
    assert_eq!(geometry.fat_sector(342), 2);
}

#[test]
fn test_new_rejects_too_many_clusters_for_fat12() {
    assert!(matches!(
        RamVolume::new(FatType::Fat12, 512, 1, 5000),
        Err(FatWalError::Config(_))
    ));
}

// =============================================================================
// FAT Entry Tests
// =============================================================================

#[test]
fn test_fat_entries_round_trip_for_every_type() {
    for fat_type in [FatType::Fat12, FatType::Fat16, FatType::Fat32, FatType::ExFat] {
        let mut volume = volume(fat_type);
        let last = fat_type.last();

        volume.write_fat_entry(10, 11).unwrap();
        volume.write_fat_entry(11, last).unwrap();
        volume.write_fat_entry(12, 300).unwrap();

        assert_eq!(volume.read_fat_entry(10).unwrap(), 11, "{:?}", fat_type);
        assert_eq!(volume.read_fat_entry(11).unwrap(), last, "{:?}", fat_type);
        assert_eq!(volume.read_fat_entry(12).unwrap(), 300, "{:?}", fat_type);
        assert_eq!(volume.read_fat_entry(13).unwrap(), FREE_CLUSTER, "{:?}", fat_type);
    }
}

#[test]
fn test_fat12_neighbours_do_not_clobber() {
    let mut volume = volume(FatType::Fat12);

    volume.write_fat_entry(4, 0xABC).unwrap();
    volume.write_fat_entry(5, 0x123).unwrap();
    volume.write_fat_entry(4, 0x456).unwrap();

    assert_eq!(volume.read_fat_entry(4).unwrap(), 0x456);
    assert_eq!(volume.read_fat_entry(5).unwrap(), 0x123);
}

#[test]
fn test_fat12_split_entry_round_trip() {
    let mut volume = volume(FatType::Fat12);

    volume.write_fat_entry(340, 0x111).unwrap();
    volume.write_fat_entry(341, 0xDEF).unwrap();
    volume.write_fat_entry(342, 0x222).unwrap();

    assert_eq!(volume.read_fat_entry(340).unwrap(), 0x111);
    assert_eq!(volume.read_fat_entry(341).unwrap(), 0xDEF);
    assert_eq!(volume.read_fat_entry(342).unwrap(), 0x222);
}

#[test]
fn test_fat32_masks_reserved_high_bits() {
    let mut volume = volume(FatType::Fat32);

    volume.write_fat_entry(10, 0xF000_0000 | 7).unwrap();
    assert_eq!(volume.read_fat_entry(10).unwrap(), 7);
}

#[test]
fn test_out_of_range_cluster_is_rejected() {
    let mut volume = volume(FatType::Fat16);
    assert!(matches!(
        volume.read_fat_entry(402),
        Err(FatWalError::SectorInvalid(_))
    ));
}

#[test]
fn test_bitmap_only_on_exfat() {
    let mut exfat = volume(FatType::ExFat);
    exfat.cluster_state_set(9, true).unwrap();
    assert!(exfat.cluster_state_get(9).unwrap());
    assert!(!exfat.cluster_state_get(10).unwrap());
    exfat.cluster_state_set(9, false).unwrap();
    assert!(!exfat.cluster_state_get(9).unwrap());

    let mut fat16 = volume(FatType::Fat16);
    fat16.cluster_state_set(9, true).unwrap();
    assert!(!fat16.cluster_state_get(9).unwrap());
}

// =============================================================================
// Cache and Power Loss Tests
// =============================================================================

#[test]
fn test_unflushed_writes_are_lost_on_power_cycle() {
    let mut volume = volume(FatType::Fat16);

    volume.write_fat_entry(10, 11).unwrap();
    volume.fat_flush().unwrap();
    volume.write_fat_entry(20, 21).unwrap();

    volume.power_cycle();

    assert_eq!(volume.read_fat_entry(10).unwrap(), 11);
    assert_eq!(volume.read_fat_entry(20).unwrap(), FREE_CLUSTER);
}

#[test]
fn test_flush_only_touches_its_kind() {
    let mut volume = volume(FatType::ExFat);
    let data_sector = volume.geometry().cluster_to_sector(5);

    volume.write_fat_entry(10, 11).unwrap();
    volume.cluster_state_set(10, true).unwrap();
    volume.write_sectors(data_sector, &[0x5A; 512], SectorKind::Directory).unwrap();

    volume.sector_cache_flush().unwrap();
    assert_eq!(volume.durable_writes(), 1);

    volume.power_cycle();

    let mut sector = vec![0u8; 512];
    volume.read_sectors(data_sector, &mut sector).unwrap();
    assert!(sector.iter().all(|&b| b == 0x5A));
    assert_eq!(volume.read_fat_entry(10).unwrap(), FREE_CLUSTER);
    assert!(!volume.cluster_state_get(10).unwrap());
}

#[test]
fn test_crash_after_writes_fails_further_flushes() {
    let mut volume = volume(FatType::Fat16);
    let first = volume.geometry().cluster_to_sector(2);

    volume.crash_after_writes(1);
    volume.write_sectors(first, &[1u8; 1024], SectorKind::Data).unwrap();

    let result = volume.sector_cache_flush();
    assert!(matches!(result, Err(FatWalError::Io(_))));
    assert!(volume.is_crashed());
    assert_eq!(volume.durable_writes(), 1);

    volume.power_cycle();
    assert!(!volume.is_crashed());

    let mut sectors = vec![0u8; 1024];
    volume.read_sectors(first, &mut sectors).unwrap();
    assert!(sectors[..512].iter().all(|&b| b == 1));
    assert!(sectors[512..].iter().all(|&b| b == 0));
}

#[test]
fn test_link_chain_and_allocated_clusters() {
    let mut volume = volume(FatType::ExFat);

    volume.link_chain(&[7, 8, 20]).unwrap();
    volume.power_cycle();

    assert_eq!(volume.read_fat_entry(7).unwrap(), 8);
    assert_eq!(volume.read_fat_entry(8).unwrap(), 20);
    assert_eq!(volume.read_fat_entry(20).unwrap(), FatType::ExFat.last());
    assert_eq!(volume.allocated_clusters().unwrap(), vec![7, 8, 20]);
    assert_eq!(volume.bitmap_used_clusters().unwrap(), vec![7, 8, 20]);
}

// =============================================================================
// Image Tests
// =============================================================================

#[test]
fn test_image_save_load_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("volume.img");

    let mut volume = volume(FatType::Fat32);
    volume.link_chain(&[3, 4, 5]).unwrap();
    volume.write_fat_entry(30, 31).unwrap(); // never flushed

    volume.save(&path).unwrap();
    let mut loaded = RamVolume::load(&path).unwrap();

    assert_eq!(loaded.geometry(), volume.geometry());
    assert_eq!(loaded.allocated_clusters().unwrap(), vec![3, 4, 5]);
}

#[test]
fn test_load_rejects_foreign_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("junk.img");
    std::fs::write(&path, b"not an image at all").unwrap();

    assert!(matches!(RamVolume::load(&path), Err(FatWalError::Config(_))));
}
