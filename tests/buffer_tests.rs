//! Tests for LogBuffer
//!
//! These tests verify:
//! - Capacity is enforced exactly
//! - Redirected FAT/bitmap reads return the last logged value
//! - Directory overlays land at the logged offset, in log order
//! - Checksum patches edit the logged directory entry in place
//! - Finalized images carry valid checksums and reload intact

use fatwal::checksum::is_valid;
use fatwal::log::{
    FatLookup, LogBuffer, LogEntry, LogKind, BASE_SIZE, CHAIN_OFFSET, CHAIN_SIZE, CONTENT_OFFSET,
    FAT_ENTRY_SIZE, HEADER_SIZE,
};
use fatwal::FatWalError;

// =============================================================================
// Helper Functions
// =============================================================================

fn buffer() -> LogBuffer {
    LogBuffer::new(3072).unwrap()
}

// =============================================================================
// Capacity Tests
// =============================================================================

#[test]
fn test_new_buffer_is_empty() {
    let buffer = buffer();

    assert_eq!(buffer.size(), BASE_SIZE);
    assert_eq!(buffer.entry_count(), 0);
    assert!(buffer.is_empty());
    assert!(!buffer.chain().is_valid());
}

#[test]
fn test_append_up_to_exact_capacity() {
    let mut buffer = LogBuffer::new(BASE_SIZE + 2 * FAT_ENTRY_SIZE).unwrap();

    buffer.add_fat_log(2, 3).unwrap();
    buffer.add_fat_log(3, 4).unwrap();

    assert_eq!(buffer.size(), buffer.capacity());
    assert_eq!(buffer.entry_count(), 2);
}

#[test]
fn test_append_one_byte_over_capacity_fails() {
    let mut buffer = LogBuffer::new(BASE_SIZE + 2 * FAT_ENTRY_SIZE - 1).unwrap();
    buffer.add_fat_log(2, 3).unwrap();

    let result = buffer.add_fat_log(3, 4);

    match result {
        Err(FatWalError::NoMoreSpace { needed, capacity }) => {
            assert_eq!(needed, capacity + 1);
        }
        other => panic!("expected NoMoreSpace, got {:?}", other),
    }
    assert_eq!(buffer.entry_count(), 1);
}

#[test]
fn test_directory_log_counts_its_data() {
    let mut buffer = LogBuffer::new(BASE_SIZE + 16 + 32).unwrap();

    assert!(buffer.add_dir_log(5, 0, &[0u8; 33]).is_err());
    buffer.add_dir_log(5, 0, &[0u8; 32]).unwrap();
    assert_eq!(buffer.size(), buffer.capacity());
}

// =============================================================================
// Redirected Read Tests
// =============================================================================

#[test]
fn test_read_fat_last_write_wins() {
    let mut buffer = buffer();
    buffer.add_fat_log(7, 100).unwrap();
    buffer.add_fat_log(8, 55).unwrap();
    buffer.add_fat_log(7, 200).unwrap();

    assert_eq!(buffer.read_fat(7, LogKind::Fat).unwrap(), FatLookup::Logged(200));
    assert_eq!(buffer.read_fat(8, LogKind::Fat).unwrap(), FatLookup::Logged(55));
}

#[test]
fn test_read_fat_unlogged_cluster_continues() {
    let mut buffer = buffer();
    buffer.add_fat_log(7, 100).unwrap();

    assert_eq!(buffer.read_fat(9, LogKind::Fat).unwrap(), FatLookup::Continue);
}

#[test]
fn test_read_fat_separates_fat_and_bitmap() {
    let mut buffer = buffer();
    buffer.add_fat_log(7, 100).unwrap();
    buffer.add_bitmap_log(7, 1).unwrap();
    buffer.add_bitmap_log(7, 0).unwrap();

    assert_eq!(buffer.read_fat(7, LogKind::Fat).unwrap(), FatLookup::Logged(100));
    assert_eq!(buffer.read_fat(7, LogKind::Bitmap).unwrap(), FatLookup::Logged(0));
    assert_eq!(buffer.read_fat(8, LogKind::Bitmap).unwrap(), FatLookup::Continue);
}

#[test]
fn test_read_fat_rejects_directory_kind() {
    let buffer = buffer();
    assert!(matches!(
        buffer.read_fat(7, LogKind::Directory),
        Err(FatWalError::SectorInvalid(_))
    ));
}

#[test]
fn test_directory_overlay() {
    let mut buffer = buffer();
    buffer.add_dir_log(5, 10, &[0xAA, 0xBB]).unwrap();

    let mut sector = vec![0x11u8; 512];
    buffer.read_directory_sector(5, &mut sector, 512).unwrap();

    assert_eq!(&sector[10..12], &[0xAA, 0xBB]);
    assert!(sector[..10].iter().all(|&b| b == 0x11));
    assert!(sector[12..].iter().all(|&b| b == 0x11));
}

#[test]
fn test_directory_overlay_later_patch_wins() {
    let mut buffer = buffer();
    buffer.add_dir_log(5, 10, &[1, 2, 3, 4]).unwrap();
    buffer.add_dir_log(5, 12, &[9, 9]).unwrap();

    let mut sector = vec![0u8; 512];
    buffer.read_directory_sector(5, &mut sector, 512).unwrap();

    assert_eq!(&sector[10..14], &[1, 2, 9, 9]);
}

#[test]
fn test_directory_overlay_covers_sector_range() {
    let mut buffer = buffer();
    buffer.add_dir_log(4, 0, &[0x44]).unwrap();
    buffer.add_dir_log(5, 1, &[0x55]).unwrap();
    buffer.add_dir_log(6, 2, &[0x66]).unwrap();

    // Two sectors starting at 5
    let mut sectors = vec![0u8; 1024];
    buffer.read_directory_sector(5, &mut sectors, 512).unwrap();

    assert_eq!(sectors[1], 0x55);
    assert_eq!(sectors[512 + 2], 0x66);
    assert_eq!(sectors.iter().filter(|&&b| b != 0).count(), 2);
}

#[test]
fn test_directory_overlay_rejects_overrun() {
    let mut buffer = buffer();
    buffer.add_dir_log(5, 500, &[0u8; 20]).unwrap();

    let mut sector = vec![0u8; 512];
    assert!(matches!(
        buffer.read_directory_sector(5, &mut sector, 512),
        Err(FatWalError::FileCorrupt(_))
    ));
}

// =============================================================================
// Checksum Patch Tests
// =============================================================================

#[test]
fn test_checksum_patch_edits_logged_entry() {
    let mut buffer = buffer();
    buffer.add_dir_log(9, 64, &[0u8; 32]).unwrap();
    let size = buffer.size();

    buffer.add_checksum_log(9, 66, 0xBEEF).unwrap();

    assert_eq!(buffer.size(), size);
    assert_eq!(buffer.entry_count(), 1);

    let mut sector = vec![0u8; 512];
    buffer.read_directory_sector(9, &mut sector, 512).unwrap();
    assert_eq!(&sector[66..68], &0xBEEFu16.to_le_bytes());
}

#[test]
fn test_checksum_patch_targets_latest_entry() {
    let mut buffer = buffer();
    buffer.add_dir_log(9, 64, &[1u8; 32]).unwrap();
    buffer.add_dir_log(9, 64, &[2u8; 32]).unwrap();

    buffer.add_checksum_log(9, 66, 0x1234).unwrap();

    let entries: Vec<_> = buffer.entries().map(|item| item.unwrap().1).collect();
    match (&entries[0], &entries[1]) {
        (LogEntry::Directory { data: first, .. }, LogEntry::Directory { data: second, .. }) => {
            assert_eq!(&first[2..4], &[1, 1]);
            assert_eq!(&second[2..4], &0x1234u16.to_le_bytes());
        }
        other => panic!("unexpected entries {:?}", other),
    }
}

#[test]
fn test_checksum_patch_without_entry_is_corrupt() {
    let mut buffer = buffer();
    buffer.add_dir_log(9, 64, &[0u8; 32]).unwrap();

    assert!(matches!(
        buffer.add_checksum_log(9, 98, 1),
        Err(FatWalError::FileCorrupt(_))
    ));
    assert!(matches!(
        buffer.add_checksum_log(10, 66, 1),
        Err(FatWalError::FileCorrupt(_))
    ));
}

// =============================================================================
// Finalize and Image Tests
// =============================================================================

#[test]
fn test_finalized_image_sections_are_valid() {
    let mut buffer = buffer();
    buffer.add_fat_log(2, 3).unwrap();
    buffer.add_dir_log(5, 0, &[7u8; 32]).unwrap();
    buffer.finalize().unwrap();

    let image = buffer.image().unwrap();

    assert_eq!(image.len(), buffer.size());
    assert_eq!(
        u16::from_le_bytes([image[4], image[5]]) as usize,
        image.len()
    );
    assert!(is_valid(&image[..HEADER_SIZE]));
    assert!(is_valid(&image[CHAIN_OFFSET..CHAIN_OFFSET + CHAIN_SIZE]));
    assert!(is_valid(&image[CONTENT_OFFSET..]));
    assert_eq!(buffer.content().count, 2);
}

#[test]
fn test_image_reloads_entries_and_index() {
    let mut buffer = buffer();
    buffer.add_fat_log(2, 3).unwrap();
    buffer.add_dir_log(5, 32, &[7u8; 32]).unwrap();
    buffer.finalize().unwrap();

    let mut reloaded = LogBuffer::from_image(&buffer.image().unwrap(), 3072).unwrap();

    assert_eq!(reloaded.entry_count(), 2);
    assert!(reloaded.content_checksum_ok().unwrap());
    assert_eq!(reloaded.read_fat(2, LogKind::Fat).unwrap(), FatLookup::Logged(3));

    // The directory index is rebuilt, so patches still find their entry
    reloaded.add_checksum_log(5, 34, 0xCAFE).unwrap();
}

#[test]
fn test_from_image_rejects_oversized_header() {
    let mut buffer = buffer();
    buffer.add_fat_log(2, 3).unwrap();
    buffer.finalize().unwrap();
    let image = buffer.image().unwrap();

    assert!(matches!(
        LogBuffer::from_image(&image, image.len() - 1),
        Err(FatWalError::FileCorrupt(_))
    ));
}

#[test]
fn test_reset_clears_entries_and_chain() {
    let mut buffer = buffer();
    buffer.add_fat_log(2, 3).unwrap();
    buffer.chain_mut().flags = fatwal::log::CHAIN_VALID;
    buffer.seal_chain().unwrap();

    buffer.reset().unwrap();

    assert!(buffer.is_empty());
    assert_eq!(buffer.size(), BASE_SIZE);
    assert!(!buffer.chain().is_valid());
    assert_eq!(buffer.read_fat(2, LogKind::Fat).unwrap(), FatLookup::Continue);
}
